//! Groups
//!
//! A group is a predicate over a user document, declared as a search query:
//!
//! ```yaml
//! type: groups
//! id: editors
//! attributes:
//!   search-query:
//!     filter:
//!       type: {exact: users}
//!       role: {exact: [editor, admin]}
//! ```

use super::model::model_id;
use crate::error::{Error, Result};
use crate::storage::document::{identifiers, Resource};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: String,
    /// Types a member may have
    pub types: Vec<String>,
    /// Field name -> accepted values
    pub filters: BTreeMap<String, BTreeSet<String>>,
}

/// Scalar JSON values compare by their string form
fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn exact_values(group: &str, field: &str, filter: &Value) -> Result<BTreeSet<String>> {
    let exact = filter.get("exact").ok_or_else(|| {
        Error::schema(format!(
            "group \"{}\" filter on \"{}\" must be an exact match",
            group, field
        ))
    })?;
    let values: BTreeSet<String> = match exact {
        Value::Array(items) => items.iter().filter_map(value_key).collect(),
        other => value_key(other).into_iter().collect(),
    };
    if values.is_empty() {
        return Err(Error::schema(format!(
            "group \"{}\" filter on \"{}\" has no usable values",
            group, field
        )));
    }
    Ok(values)
}

impl Group {
    pub fn from_model(model: &Resource) -> Result<Self> {
        let id = model_id(model)?.to_string();
        let filter = model
            .attribute("search-query")
            .and_then(|q| q.get("filter"))
            .and_then(Value::as_object)
            .ok_or_else(|| Error::schema(format!("group \"{}\" needs a search-query filter", id)))?;

        let type_filter = filter
            .get("type")
            .ok_or_else(|| Error::schema(format!("group \"{}\" must filter on type", id)))?;
        let types = exact_values(&id, "type", type_filter)?.into_iter().collect();

        let mut filters = BTreeMap::new();
        for (field, value) in filter {
            if field == "type" {
                continue;
            }
            filters.insert(field.clone(), exact_values(&id, field, value)?);
        }

        Ok(Self { id, types, filters })
    }

    /// Values the document holds for `field`: `id`, an attribute, or the
    /// ids of a relationship
    fn document_values(document: &Resource, field: &str) -> BTreeSet<String> {
        if field == "id" {
            return document.id.iter().cloned().collect();
        }
        if let Some(value) = document.attribute(field) {
            return match value {
                Value::Array(items) => items.iter().filter_map(value_key).collect(),
                other => value_key(other).into_iter().collect(),
            };
        }
        identifiers(document.relationship_data(field))
            .into_iter()
            .map(|r| r.id)
            .collect()
    }

    /// True if `document` is a member of this group
    pub fn test(&self, document: &Resource) -> bool {
        if !self.types.iter().any(|t| *t == document.kind) {
            return false;
        }
        self.filters.iter().all(|(field, accepted)| {
            let held = Self::document_values(document, field);
            !held.is_disjoint(accepted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn group(filter: Value) -> Result<Group> {
        let model: Resource = serde_json::from_value(json!({
            "type": "groups",
            "id": "editors",
            "attributes": {"search-query": {"filter": filter}}
        }))
        .unwrap();
        Group::from_model(&model)
    }

    #[test]
    fn test_scalar_membership() {
        let g = group(json!({"type": {"exact": "users"}, "role": {"exact": "editor"}})).unwrap();
        let editor = Resource::new("users", Some("u1".into())).with_attribute("role", "editor");
        let reader = Resource::new("users", Some("u2".into())).with_attribute("role", "reader");
        assert!(g.test(&editor));
        assert!(!g.test(&reader));
        let wrong_type = Resource::new("robots", Some("r".into())).with_attribute("role", "editor");
        assert!(!g.test(&wrong_type));
    }

    #[test]
    fn test_array_intersection() {
        let g = group(json!({"type": {"exact": ["users"]}, "roles": {"exact": ["editor", "admin"]}}))
            .unwrap();
        let user =
            Resource::new("users", Some("u1".into())).with_attribute("roles", json!(["admin", "x"]));
        assert!(g.test(&user));
        let none = Resource::new("users", Some("u2".into())).with_attribute("roles", json!([]));
        assert!(!g.test(&none));
    }

    #[test]
    fn test_relationship_and_id_filters() {
        let g = group(json!({"type": {"exact": "users"}, "team": {"exact": "t1"}, "id": {"exact": "u1"}}))
            .unwrap();
        let user = Resource::new("users", Some("u1".into()))
            .with_relationship("team", json!({"type": "teams", "id": "t1"}));
        assert!(g.test(&user));
    }

    #[test]
    fn test_type_filter_required() {
        assert!(group(json!({"role": {"exact": "editor"}})).is_err());
        assert!(group(json!({"type": {"range": {"gt": 1}}})).is_err());
    }
}
