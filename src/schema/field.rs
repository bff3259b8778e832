//! Fields
//!
//! A field is one attribute or relationship of a content type. It knows
//! where its value lives in a resource, how to default it, and how to check
//! a write to it.

use super::grant::Grant;
use super::model::{attr_bool, attr_str, model_id, rel_id, rel_ids};
use super::plugins::{FieldType, PluginRegistry, Validity};
use crate::error::{Error, Result};
use crate::session::UserRealms;
use crate::storage::document::{identifiers, PendingChange, Resource, Section, Side};
use crate::validation::validate_field_name;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Names of the fields every content type has
pub const IMPLICIT_FIELDS: &[&str] = &["type", "id"];

#[derive(Clone)]
pub struct Field {
    pub id: String,
    /// Plugin key
    pub field_type: String,
    pub plugin: Arc<dyn FieldType>,
    /// `Some(Value::Null)` is a null default, distinct from no default
    pub default_at_create: Option<Value>,
    pub default_at_update: Option<Value>,
    pub is_relationship: bool,
    pub is_plural: bool,
    /// None = any type may be related
    pub related_types: Option<BTreeSet<String>>,
    pub searchable: bool,
    /// Grants that cover this field, in declaration order
    pub grants: Vec<Grant>,
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("id", &self.id)
            .field("field_type", &self.field_type)
            .field("default_at_create", &self.default_at_create)
            .field("default_at_update", &self.default_at_update)
            .field("is_relationship", &self.is_relationship)
            .field("related_types", &self.related_types)
            .finish()
    }
}

impl Field {
    /// Build from a `fields` model
    ///
    /// `default_values` maps `default-values` ids to their values; `grants`
    /// is the full grant list of the schema.
    pub fn from_model(
        model: &Resource,
        plugins: &PluginRegistry,
        default_values: &HashMap<String, Value>,
        grants: &[Grant],
    ) -> Result<Self> {
        let id = model_id(model)?.to_string();
        validate_field_name(&id)?;

        let field_type = attr_str(model, "field-type")
            .ok_or_else(|| Error::schema(format!("field \"{}\" has no field-type", id)))?
            .to_string();
        let plugin = plugins.field_type(&field_type)?;

        let lookup_default = |relationship: &str| -> Result<Option<Value>> {
            match rel_id(model, relationship) {
                None => Ok(None),
                Some(default_id) => default_values.get(&default_id).cloned().map(Some).ok_or_else(|| {
                    Error::schema(format!(
                        "field \"{}\" refers to missing default-values \"{}\"",
                        id, default_id
                    ))
                }),
            }
        };
        let default_at_create = lookup_default("default-at-create")?;
        let default_at_update = lookup_default("default-at-update")?;

        let related_types = rel_ids(model, "related-types").map(|ids| ids.into_iter().collect());
        if related_types.is_some() && !plugin.is_relationship() {
            return Err(Error::schema(format!(
                "field \"{}\" has related-types but is not a relationship",
                id
            )));
        }

        Ok(Self {
            grants: grants
                .iter()
                .filter(|g| g.covers_field(&id))
                .cloned()
                .collect(),
            is_relationship: plugin.is_relationship(),
            is_plural: plugin.is_plural(),
            searchable: attr_bool(model, "searchable", true),
            id,
            field_type,
            plugin,
            default_at_create,
            default_at_update,
            related_types,
        })
    }

    /// The `type` or `id` field every content type carries
    pub fn implicit(name: &str, plugins: &PluginRegistry) -> Result<Self> {
        let plugin = plugins.field_type("string")?;
        Ok(Self {
            id: name.to_string(),
            field_type: "string".to_string(),
            plugin,
            default_at_create: None,
            default_at_update: None,
            is_relationship: false,
            is_plural: false,
            related_types: None,
            searchable: true,
            grants: Vec::new(),
        })
    }

    pub fn is_implicit(&self) -> bool {
        IMPLICIT_FIELDS.contains(&self.id.as_str())
    }

    pub fn section(&self) -> Section {
        if self.is_implicit() {
            Section::TopLevel
        } else if self.is_relationship {
            Section::Relationships
        } else {
            Section::Attributes
        }
    }

    pub fn pointer(&self) -> String {
        self.section().pointer(&self.id)
    }

    /// The field's value in a resource; None when the field is absent
    pub fn value_in(&self, resource: &Resource) -> Option<Value> {
        match self.section() {
            Section::TopLevel => match self.id.as_str() {
                "type" => Some(Value::String(resource.kind.clone())),
                _ => resource.id.clone().map(Value::String),
            },
            Section::Attributes => resource.attribute(&self.id).cloned(),
            Section::Relationships => resource.relationship_data(&self.id).cloned(),
        }
    }

    pub fn value_from(&self, change: &PendingChange, side: Side) -> Option<Value> {
        change.document(side).and_then(|doc| self.value_in(doc))
    }

    fn write_value(&self, resource: &mut Resource, value: Value) {
        match self.section() {
            Section::TopLevel => match (self.id.as_str(), value) {
                ("type", Value::String(kind)) => resource.kind = kind,
                ("id", Value::String(id)) => resource.id = Some(id),
                ("id", Value::Null) => resource.id = None,
                _ => {}
            },
            Section::Attributes => resource.set_attribute(self.id.clone(), value),
            Section::Relationships => resource.set_relationship_data(self.id.clone(), value),
        }
    }

    /// Fill in a default on `change.final_document`, recording what was
    /// injected in `server_provided_values`
    pub fn apply_default(&self, change: &mut PendingChange, type_name: &str) {
        let is_create = change.is_create();
        let current = self.value_from(change, Side::Final);

        let chosen = if is_create {
            if current.is_some() {
                return;
            }
            self.default_at_create
                .clone()
                .or_else(|| self.default_at_update.clone())
                .or_else(|| (self.id == "type").then(|| Value::String(type_name.to_string())))
                .or_else(|| self.plugin.default_value())
        } else {
            let Some(default) = &self.default_at_update else {
                return;
            };
            if current != self.value_from(change, Side::Original) {
                return;
            }
            Some(default.clone())
        };

        let Some(default) = chosen else {
            return;
        };
        let value = self.plugin.generate_default(&default);
        if let Some(doc) = change.final_document.as_mut() {
            self.write_value(doc, value.clone());
            change.server_provided_values.insert(self.id.clone(), value);
        }
    }

    /// First grant letting `user_realms` write this field on `document`
    pub fn write_grant(&self, document: &Resource, user_realms: &UserRealms) -> Option<&Grant> {
        self.grants
            .iter()
            .find(|g| g.may_write_fields && g.matches(document, user_realms))
    }

    /// True if the value of this field in the final document came from the
    /// requester rather than from the server or the original document
    pub fn is_user_supplied(&self, change: &PendingChange) -> bool {
        let Some(value) = self.value_from(change, Side::Final) else {
            return false;
        };
        if change.server_provided_values.get(&self.id) == Some(&value) {
            return false;
        }
        if !change.is_create() && self.value_from(change, Side::Original).as_ref() == Some(&value) {
            return false;
        }
        true
    }

    /// Every problem with this field's value in the final document
    pub fn validation_errors(&self, change: &PendingChange, user_realms: &UserRealms) -> Vec<Error> {
        let mut errors = Vec::new();
        let Some(document) = change.final_document.as_ref() else {
            return errors;
        };

        if let Some(err) = self.misplaced(document) {
            errors.push(err);
        }

        let Some(value) = self.value_in(document) else {
            return errors;
        };

        if !self.is_implicit()
            && self.is_user_supplied(change)
            && self.write_grant(document, user_realms).is_none()
        {
            errors.push(Error::MayNotWriteField {
                field: self.id.clone(),
                pointer: self.pointer(),
            });
            return errors;
        }

        if value.is_null() {
            return errors;
        }

        match self.plugin.valid(&value) {
            Validity::Valid => {}
            Validity::Invalid => errors.push(Error::InvalidValue {
                detail: format!("{} is not a valid value for field \"{}\"", value, self.id),
                pointer: self.pointer(),
            }),
            Validity::Reason(detail) => errors.push(Error::InvalidValue {
                detail,
                pointer: self.pointer(),
            }),
        }

        if let Some(allowed) = &self.related_types {
            for target in identifiers(Some(&value)) {
                if !allowed.contains(&target.kind) {
                    errors.push(Error::InvalidValue {
                        detail: format!(
                            "field \"{}\" refers to disallowed type \"{}\"",
                            self.id, target.kind
                        ),
                        pointer: self.pointer(),
                    });
                }
            }
        }

        errors
    }

    /// A value placed in the other section than the one this field lives in
    fn misplaced(&self, document: &Resource) -> Option<Error> {
        let (wrong, right) = match self.section() {
            Section::TopLevel => return None,
            Section::Attributes => (document.relationships.contains_key(&self.id), "attributes"),
            Section::Relationships => (document.attributes.contains_key(&self.id), "relationships"),
        };
        wrong.then(|| Error::InvalidValue {
            detail: format!("field \"{}\" belongs in {}", self.id, right),
            pointer: self.pointer(),
        })
    }

    /// Postgres type a filter on this field compares as
    pub fn sql_cast(&self) -> Option<&'static str> {
        self.plugin.sql_cast()
    }

    /// True if `text` can be compared against this field's values
    pub fn valid_sql_literal(&self, text: &str) -> bool {
        self.plugin.valid_sql_literal(text)
    }

    pub fn search_index_format(&self, value: &Value) -> Value {
        self.plugin.search_index_format(value)
    }
}
