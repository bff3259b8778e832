//! Content types
//!
//! A content type owns its fields, computed fields, constraints and the
//! grants that apply to it. It runs the validation pipeline for writes,
//! projects resources down to what a reader may see, and flattens resources
//! into the search documents the query compiler targets.

use super::computed_field::ComputedField;
use super::constraint::Constraint;
use super::data_source::DataSource;
use super::field::{Field, IMPLICIT_FIELDS};
use super::grant::{find_matching, Capability, Grant};
use super::model::{model_id, rel_id, rel_ids};
use super::plugins::PluginRegistry;
use super::realms::Realms;
use super::Schema;
use crate::error::{Error, Result};
use crate::session::UserRealms;
use crate::storage::document::{identifiers, DocRef, PendingChange, Resource, Section, Side};
use crate::validation::validate_type_name;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Relationship paths to expand, as a tree: `author.team` ->
/// `{author: {team: {}}}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IncludesTree(pub BTreeMap<String, IncludesTree>);

impl IncludesTree {
    pub fn from_paths<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tree = Self::default();
        for path in paths {
            let mut node = &mut tree;
            for segment in path.split('.').filter(|s| !s.is_empty()) {
                node = node.0.entry(segment.to_string()).or_default();
            }
        }
        tree
    }

    pub fn child(&self, field: &str) -> Option<&IncludesTree> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One entry of a fieldset: a relationship to include for a format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fieldset {
    pub field: String,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContentType {
    pub id: String,
    /// Declared fields plus `type` and `id`
    pub real_fields: HashMap<String, Field>,
    pub computed_fields: HashMap<String, ComputedField>,
    pub data_source: Option<Arc<DataSource>>,
    /// Grants whose type list admits this type, in declaration order
    pub grants: Vec<Grant>,
    /// Constraints whose inputs are all real fields of this type
    pub constraints: Vec<Constraint>,
    pub includes_tree: IncludesTree,
    /// Format name -> relationships to include for that format
    pub fieldsets: BTreeMap<String, Vec<Fieldset>>,
    pub realms: Realms,
}

/// Most computed fields a single lookup may chain through
const MAX_COMPUTED_DEPTH: usize = 16;

impl ContentType {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn from_model(
        model: &Resource,
        fields: &HashMap<String, Field>,
        computed: &HashMap<String, ComputedField>,
        grants: &[Grant],
        constraints: &[Constraint],
        data_sources: &HashMap<String, Arc<DataSource>>,
        plugins: &PluginRegistry,
    ) -> Result<Self> {
        let id = model_id(model)?.to_string();
        validate_type_name(&id)?;

        let mut real_fields = HashMap::new();
        for name in IMPLICIT_FIELDS {
            real_fields.insert(name.to_string(), Field::implicit(name, plugins)?);
        }
        let mut computed_fields = HashMap::new();
        for name in rel_ids(model, "fields").unwrap_or_default() {
            if IMPLICIT_FIELDS.contains(&name.as_str()) {
                continue;
            }
            if let Some(field) = fields.get(&name) {
                real_fields.insert(name, field.clone());
            } else if let Some(field) = computed.get(&name) {
                computed_fields.insert(name, field.clone());
            } else {
                return Err(Error::schema(format!(
                    "content type \"{}\" refers to missing field \"{}\"",
                    id, name
                )));
            }
        }

        let data_source = match rel_id(model, "data-source") {
            None => None,
            Some(source) => Some(data_sources.get(&source).cloned().ok_or_else(|| {
                Error::schema(format!(
                    "content type \"{}\" refers to missing data source \"{}\"",
                    id, source
                ))
            })?),
        };

        let grants: Vec<Grant> = grants
            .iter()
            .filter(|g| g.applies_to_type(&id))
            .cloned()
            .collect();
        let constraints = constraints
            .iter()
            .filter(|c| c.fields().all(|f| real_fields.contains_key(f)))
            .cloned()
            .collect();

        let includes_tree = match model.attribute("default-includes") {
            Some(Value::Array(paths)) => IncludesTree::from_paths(paths.iter().filter_map(Value::as_str)),
            Some(Value::String(paths)) => IncludesTree::from_paths(paths.split(',')),
            _ => IncludesTree::default(),
        };
        let fieldsets = match model.attribute("fieldsets") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                Error::schema(format!("content type \"{}\" has bad fieldsets: {}", id, e))
            })?,
        };

        Ok(Self {
            realms: Realms::from_grants(&grants),
            id,
            real_fields,
            computed_fields,
            data_source,
            grants,
            constraints,
            includes_tree,
            fieldsets,
        })
    }

    /// A real or computed field of this type
    pub fn real_or_computed_field(&self, name: &str) -> Option<&Field> {
        self.real_fields
            .get(name)
            .or_else(|| self.computed_fields.get(name).map(|c| &c.virtual_field))
    }

    pub fn fieldset(&self, format: &str) -> &[Fieldset] {
        self.fieldsets.get(format).map(Vec::as_slice).unwrap_or(&[])
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Validate a pending change to a resource of this type
    ///
    /// Defaults are written into `change.final_document`. All field and
    /// constraint errors are reported together.
    pub fn validate(&self, change: &mut PendingChange, user_realms: &UserRealms) -> Result<()> {
        self.authorize_resource(change, user_realms)?;

        let mut errors = Vec::new();
        let mut bad_fields = BTreeSet::new();

        if let Some(document) = change.final_document.as_ref() {
            for field in self.real_fields.values() {
                if field.is_implicit() || !field.is_user_supplied(change) {
                    continue;
                }
                if !self.realms.may_read_field(&field.id, user_realms)
                    && field.write_grant(document, user_realms).is_none()
                {
                    errors.push(Error::MayNotWriteField {
                        field: field.id.clone(),
                        pointer: field.pointer(),
                    });
                    bad_fields.insert(field.id.clone());
                }
            }
        }

        for field in self.real_fields.values() {
            field.apply_default(change, &self.id);
        }

        let mut field_names: Vec<&String> = self.real_fields.keys().collect();
        field_names.sort();
        for name in field_names {
            if bad_fields.contains(name) {
                continue;
            }
            let field_errors = self.real_fields[name].validation_errors(change, user_realms);
            if !field_errors.is_empty() {
                bad_fields.insert(name.clone());
                errors.extend(field_errors);
            }
        }

        if let Some(document) = change.final_document.as_ref() {
            for constraint in &self.constraints {
                if constraint.fields().any(|f| bad_fields.contains(f)) {
                    continue;
                }
                if let Some(err) = constraint.check(document, &self.real_fields) {
                    errors.push(err);
                }
            }
            errors.extend(self.unknown_fields(document, change.original_document.as_ref()));
        }

        if !errors.is_empty() {
            tracing::debug!(type_name = %self.id, errors = errors.len(), "validation failed");
        }
        Error::from_many(errors)
    }

    fn authorize_resource(&self, change: &PendingChange, user_realms: &UserRealms) -> Result<()> {
        let find = |capability, document: &Resource| {
            find_matching(&self.grants, capability, document, user_realms)
        };
        let not_found = |document: &Resource| Error::NotFound {
            type_name: self.id.clone(),
            id: document.id.clone().unwrap_or_default(),
        };

        match (change.document(Side::Original), change.document(Side::Final)) {
            (None, Some(created)) => {
                // the create grant itself covers reading back what was created
                if find(Capability::CreateResource, created).is_none() {
                    return Err(Error::MayNotCreate {
                        type_name: self.id.clone(),
                    });
                }
                Ok(())
            }
            (Some(original), Some(_)) => {
                if find(Capability::ReadResource, original).is_none()
                    && find(Capability::UpdateResource, original).is_none()
                {
                    return Err(not_found(original));
                }
                if find(Capability::UpdateResource, original).is_none() {
                    return Err(Error::MayNotUpdate {
                        type_name: self.id.clone(),
                        id: original.id.clone().unwrap_or_default(),
                    });
                }
                Ok(())
            }
            (Some(original), None) => {
                if find(Capability::ReadResource, original).is_none()
                    && find(Capability::DeleteResource, original).is_none()
                {
                    return Err(not_found(original));
                }
                if find(Capability::DeleteResource, original).is_none() {
                    return Err(Error::MayNotDelete {
                        type_name: self.id.clone(),
                        id: original.id.clone().unwrap_or_default(),
                    });
                }
                Ok(())
            }
            (None, None) => Err(Error::Other("a change needs an original or final document".into())),
        }
    }

    /// Attribute and relationship keys this type does not declare; keys the
    /// original already carried pass through
    fn unknown_fields(&self, document: &Resource, original: Option<&Resource>) -> Vec<Error> {
        let mut errors = Vec::new();
        let sections = [
            (Section::Attributes, &document.attributes, original.map(|o| &o.attributes)),
            (
                Section::Relationships,
                &document.relationships,
                original.map(|o| &o.relationships),
            ),
        ];
        for (section, members, previous) in sections {
            for key in members.keys() {
                if self.real_fields.contains_key(key) {
                    continue;
                }
                if previous.map(|p| p.contains_key(key)).unwrap_or(false) {
                    continue;
                }
                errors.push(Error::UnknownField {
                    type_name: self.id.clone(),
                    field: key.clone(),
                    pointer: section.pointer(key),
                });
            }
        }
        errors
    }

    // =========================================================================
    // Reading
    // =========================================================================

    pub fn may_read_resource(&self, resource: &Resource, user_realms: &UserRealms) -> bool {
        find_matching(&self.grants, Capability::ReadResource, resource, user_realms).is_some()
    }

    /// The part of `resource` the requester may see
    ///
    /// `type`, `id` and `meta` are always kept.
    pub fn apply_read_authorization(&self, resource: &Resource, user_realms: &UserRealms) -> Resource {
        if self.realms.may_read_all_fields(user_realms) {
            return resource.clone();
        }
        let readable = |name: &String| self.realms.may_read_field(name, user_realms);
        Resource {
            kind: resource.kind.clone(),
            id: resource.id.clone(),
            attributes: resource
                .attributes
                .iter()
                .filter(|(name, _)| readable(name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            relationships: resource
                .relationships
                .iter()
                .filter(|(name, _)| readable(name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            meta: resource.meta.clone(),
        }
    }

    /// Value of a real or computed field of `resource`
    pub fn field_value(&self, resource: &Resource, name: &str) -> Option<Value> {
        self.field_value_at(resource, name, 0)
    }

    fn field_value_at(&self, resource: &Resource, name: &str, depth: usize) -> Option<Value> {
        if let Some(field) = self.real_fields.get(name) {
            return field.value_in(resource);
        }
        if depth >= MAX_COMPUTED_DEPTH {
            return None;
        }
        let computed = self.computed_fields.get(name)?;
        let value = computed.compute(&|other| self.field_value_at(resource, other, depth + 1));
        (!value.is_null()).then_some(value)
    }

    // =========================================================================
    // Search documents
    // =========================================================================

    /// Flatten `resource` into its search document
    ///
    /// Relationships become `{type, id}` objects, expanded with the related
    /// resource's own search document when the includes tree names them and
    /// the resource is in `included`.
    pub fn search_doc(&self, schema: &Schema, resource: &Resource, included: &[Resource]) -> Value {
        self.search_doc_at(schema, resource, included, &self.includes_tree)
    }

    fn search_doc_at(
        &self,
        schema: &Schema,
        resource: &Resource,
        included: &[Resource],
        tree: &IncludesTree,
    ) -> Value {
        let mut doc = Map::new();
        for field in self.real_fields.values() {
            if !field.searchable {
                continue;
            }
            let Some(value) = field.value_in(resource) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if !field.is_relationship {
                doc.insert(field.id.clone(), field.search_index_format(&value));
                continue;
            }
            let expand = |target: DocRef| -> Value {
                let mut entry = target.to_identifier();
                let nested = tree.child(&field.id).and_then(|subtree| {
                    let related = included
                        .iter()
                        .find(|r| r.kind == target.kind && r.id.as_deref() == Some(target.id.as_str()))?;
                    let related_type = schema.content_type(&target.kind)?;
                    Some(related_type.search_doc_at(schema, related, included, subtree))
                });
                if let (Some(Value::Object(extra)), Some(obj)) = (nested, entry.as_object_mut()) {
                    for (k, v) in extra {
                        obj.entry(k).or_insert(v);
                    }
                }
                entry
            };
            let targets = identifiers(Some(&value));
            let flattened = if field.is_plural {
                Value::Array(targets.into_iter().map(expand).collect())
            } else {
                match targets.into_iter().next() {
                    Some(target) => expand(target),
                    None => continue,
                }
            };
            doc.insert(field.id.clone(), flattened);
        }
        for computed in self.computed_fields.values() {
            if let Some(value) = self.field_value(resource, &computed.id) {
                doc.insert(
                    computed.id.clone(),
                    computed.virtual_field.search_index_format(&value),
                );
            }
        }
        Value::Object(doc)
    }

    /// Description of how each field is stored and compared
    pub fn mapping(&self) -> Value {
        let mut fields: Vec<&Field> = self.real_fields.values().collect();
        fields.extend(self.computed_fields.values().map(|c| &c.virtual_field));
        fields.sort_by(|a, b| a.id.cmp(&b.id));
        let entries: Map<String, Value> = fields
            .into_iter()
            .map(|f| {
                (
                    f.id.clone(),
                    json!({
                        "field-type": f.field_type,
                        "relationship": f.is_relationship,
                        "plural": f.is_plural,
                        "searchable": f.searchable,
                        "sql-cast": f.sql_cast(),
                    }),
                )
            })
            .collect();
        json!({ "type": self.id, "fields": entries })
    }
}
