//! Constraints
//!
//! A constraint binds a validator plugin to one or more fields through named
//! inputs, e.g. `{"target": "title"}`.

use super::field::Field;
use super::model::{attr_str, model_id};
use super::plugins::{ConstraintInput, ConstraintType, PluginRegistry, Validity};
use crate::error::{Error, Result};
use crate::storage::document::Resource;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct Constraint {
    pub id: String,
    pub constraint_type: String,
    pub plugin: Arc<dyn ConstraintType>,
    /// Input name -> field name
    pub inputs: BTreeMap<String, String>,
    pub parameters: Value,
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("id", &self.id)
            .field("constraint_type", &self.constraint_type)
            .field("inputs", &self.inputs)
            .finish()
    }
}

impl Constraint {
    pub fn from_model(model: &Resource, plugins: &PluginRegistry) -> Result<Self> {
        let id = model_id(model)?.to_string();
        let constraint_type = attr_str(model, "constraint-type")
            .ok_or_else(|| Error::schema(format!("constraint \"{}\" has no constraint-type", id)))?
            .to_string();
        let plugin = plugins.constraint_type(&constraint_type)?;

        let mut inputs = BTreeMap::new();
        if let Some(map) = model.attribute("inputs").and_then(Value::as_object) {
            for (name, field) in map {
                let field = field.as_str().ok_or_else(|| {
                    Error::schema(format!(
                        "constraint \"{}\" input \"{}\" must name a field",
                        id, name
                    ))
                })?;
                inputs.insert(name.clone(), field.to_string());
            }
        }
        for required in plugin.inputs() {
            if !inputs.contains_key(*required) {
                return Err(Error::schema(format!(
                    "constraint \"{}\" is missing input \"{}\"",
                    id, required
                )));
            }
        }

        let parameters = model.attribute("parameters").cloned().unwrap_or(Value::Null);
        let plugin = plugin.prepare(&parameters)?.unwrap_or(plugin);

        Ok(Self {
            id,
            constraint_type,
            plugin,
            inputs,
            parameters,
        })
    }

    /// Field names this constraint reads
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.inputs.values().map(String::as_str)
    }

    /// Check `document`; absent inputs read as null
    pub fn check(&self, document: &Resource, fields: &HashMap<String, Field>) -> Option<Error> {
        let values: Vec<(&str, &str, Value)> = self
            .inputs
            .iter()
            .map(|(name, field)| {
                let value = fields
                    .get(field)
                    .and_then(|f| f.value_in(document))
                    .unwrap_or(Value::Null);
                (name.as_str(), field.as_str(), value)
            })
            .collect();
        let inputs: Vec<ConstraintInput<'_>> = values
            .iter()
            .map(|(name, field, value)| ConstraintInput {
                name: *name,
                field: *field,
                value,
            })
            .collect();

        let detail = match self.plugin.valid(&inputs, &self.parameters) {
            Validity::Valid => return None,
            Validity::Invalid => format!("constraint \"{}\" failed", self.id),
            Validity::Reason(detail) => detail,
        };
        let pointer = match self.inputs.len() {
            1 => self
                .fields()
                .next()
                .and_then(|name| fields.get(name))
                .map(Field::pointer),
            _ => None,
        };
        Some(Error::ConstraintViolation { detail, pointer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constraint(model: Value) -> Result<Constraint> {
        let model: Resource = serde_json::from_value(model).unwrap();
        Constraint::from_model(&model, &PluginRegistry::with_builtins())
    }

    #[test]
    fn test_not_null() {
        let registry = PluginRegistry::with_builtins();
        let title: Resource = serde_json::from_value(
            json!({"type": "fields", "id": "title", "attributes": {"field-type": "string"}}),
        )
        .unwrap();
        let fields: HashMap<String, Field> = [(
            "title".to_string(),
            Field::from_model(&title, &registry, &HashMap::new(), &[]).unwrap(),
        )]
        .into_iter()
        .collect();

        let c = constraint(json!({
            "type": "constraints", "id": "title-required",
            "attributes": {"constraint-type": "not-null", "inputs": {"target": "title"}}
        }))
        .unwrap();
        assert_eq!(c.fields().collect::<Vec<_>>(), vec!["title"]);

        let missing = Resource::new("articles", Some("1".into()));
        let err = c.check(&missing, &fields).unwrap();
        assert_eq!(err.status(), 400);
        assert_eq!(err.pointer(), Some("/data/attributes/title"));

        let present = missing.with_attribute("title", "x");
        assert!(c.check(&present, &fields).is_none());
    }

    #[test]
    fn test_matches_pattern_compiled_at_load() {
        let registry = PluginRegistry::with_builtins();
        let slug: Resource = serde_json::from_value(
            json!({"type": "fields", "id": "slug", "attributes": {"field-type": "string"}}),
        )
        .unwrap();
        let fields: HashMap<String, Field> = [(
            "slug".to_string(),
            Field::from_model(&slug, &registry, &HashMap::new(), &[]).unwrap(),
        )]
        .into_iter()
        .collect();

        let c = constraint(json!({
            "type": "constraints", "id": "slug-shape",
            "attributes": {"constraint-type": "matches", "inputs": {"target": "slug"},
                           "parameters": {"pattern": "^[a-z-]+$"}}
        }))
        .unwrap();
        let doc = Resource::new("articles", Some("1".into()));
        assert!(c.check(&doc.clone().with_attribute("slug", "hello-world"), &fields).is_none());
        let err = c.check(&doc.with_attribute("slug", "Hello World"), &fields).unwrap();
        assert!(err.to_string().contains("must match ^[a-z-]+$"));

        assert!(constraint(json!({
            "type": "constraints", "id": "c",
            "attributes": {"constraint-type": "matches", "inputs": {"target": "slug"},
                           "parameters": {"pattern": "("}}
        }))
        .is_err());
    }

    #[test]
    fn test_schema_errors() {
        assert!(constraint(json!({
            "type": "constraints", "id": "c",
            "attributes": {"constraint-type": "not-null"}
        }))
        .is_err());
        assert!(constraint(json!({
            "type": "constraints", "id": "c",
            "attributes": {"constraint-type": "max-length", "inputs": {"target": "title"}}
        }))
        .is_err());
        assert!(constraint(json!({
            "type": "constraints", "id": "c",
            "attributes": {"constraint-type": "bogus", "inputs": {"target": "title"}}
        }))
        .is_err());
    }
}
