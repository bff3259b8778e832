//! Schema models
//!
//! The schema is itself data: JSON:API resources of a handful of
//! well-known types. This module reads their members and loads them from a
//! directory of `*.json` / `*.yaml` files.

use crate::error::{Error, Result};
use crate::storage::document::Resource;
use serde_json::Value;
use std::path::Path;
use walkdir::WalkDir;

/// Resource types that make up the schema
pub const SCHEMA_TYPES: &[&str] = &[
    "content-types",
    "fields",
    "computed-fields",
    "constraints",
    "grants",
    "groups",
    "data-sources",
    "default-values",
    "card-definitions",
];

/// True when a resource of this type changes the schema
pub fn is_schema_type(kind: &str) -> bool {
    SCHEMA_TYPES.contains(&kind)
}

/// A model's id, or a schema error naming its type
pub fn model_id(model: &Resource) -> Result<&str> {
    model
        .id
        .as_deref()
        .ok_or_else(|| Error::schema(format!("{} model is missing an id", model.kind)))
}

pub fn attr_str<'a>(model: &'a Resource, name: &str) -> Option<&'a str> {
    model.attribute(name).and_then(Value::as_str)
}

pub fn attr_bool(model: &Resource, name: &str, default: bool) -> bool {
    model.attribute(name).and_then(Value::as_bool).unwrap_or(default)
}

/// Ids of a to-many relationship; None when absent or null
pub fn rel_ids(model: &Resource, name: &str) -> Option<Vec<String>> {
    match model.relationship_data(name) {
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(|item| item.get("id").and_then(Value::as_str).map(String::from))
                .collect(),
        ),
        _ => None,
    }
}

/// Id of a to-one relationship; None when absent or null
pub fn rel_id(model: &Resource, name: &str) -> Option<String> {
    model
        .relationship_data(name)
        .and_then(|data| data.get("id"))
        .and_then(Value::as_str)
        .map(String::from)
}

/// Load every model under `dir`
///
/// A file may hold one model, an array of models, or a `{"data": [...]}`
/// document.
pub fn load_models(dir: &Path) -> Result<Vec<Resource>> {
    let mut models = Vec::new();

    if !dir.exists() {
        return Ok(models);
    }

    let mut paths: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| matches!(e, "json" | "yaml" | "yml"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    for path in paths {
        let content = std::fs::read_to_string(&path).map_err(|source| Error::FileReadError {
            path: path.clone(),
            source,
        })?;
        let value: Value = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        models.extend(models_from_value(value)?);
    }

    tracing::debug!(dir = %dir.display(), count = models.len(), "loaded schema models");
    Ok(models)
}

/// Read models out of one JSON value
pub fn models_from_value(value: Value) -> Result<Vec<Resource>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(Error::from))
            .collect(),
        Value::Object(mut obj) => match obj.remove("data") {
            Some(data) => models_from_value(data),
            None => Ok(vec![serde_json::from_value(Value::Object(obj))?]),
        },
        _ => Err(Error::schema("schema files must contain models")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_relationship_readers() {
        let model: Resource = serde_json::from_value(json!({
            "type": "grants",
            "id": "g1",
            "attributes": {"may-read-resource": true},
            "relationships": {
                "types": {"data": [{"type": "content-types", "id": "articles"}]},
                "who": {"data": {"type": "groups", "id": "editors"}},
                "fields": {"data": null}
            }
        }))
        .unwrap();
        assert_eq!(rel_ids(&model, "types"), Some(vec!["articles".to_string()]));
        assert_eq!(rel_ids(&model, "fields"), None);
        assert_eq!(rel_id(&model, "who"), Some("editors".to_string()));
        assert!(attr_bool(&model, "may-read-resource", false));
        assert!(!attr_bool(&model, "may-write-fields", false));
    }

    #[test]
    fn test_load_models_from_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join("types.json"),
            r#"{"data": [{"type": "content-types", "id": "articles"}]}"#,
        )
        .unwrap();
        std::fs::create_dir(tmp.path().join("nested")).unwrap();
        std::fs::write(
            tmp.path().join("nested/fields.yaml"),
            "- type: fields\n  id: title\n  attributes:\n    field-type: string\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("README.md"), "ignored").unwrap();

        let models = load_models(tmp.path()).unwrap();
        assert_eq!(models.len(), 2);
        assert!(models.iter().any(|m| m.kind == "fields"));
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let models = load_models(Path::new("/definitely/not/here")).unwrap();
        assert!(models.is_empty());
    }
}
