//! Computed fields
//!
//! A computed field is read-only and derived from other fields. Its type
//! may depend on other fields' types, so computed fields are resolved in a
//! second pass once every real field is known.

use super::field::Field;
use super::grant::Grant;
use super::model::{attr_str, model_id};
use super::plugins::{ComputedFieldType, PluginRegistry};
use crate::error::{Error, Result};
use crate::storage::document::Resource;
use crate::validation::validate_field_name;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct ComputedField {
    pub id: String,
    pub computed_type: String,
    pub plugin: Arc<dyn ComputedFieldType>,
    pub params: Value,
    /// The field as seen by readers and the query compiler
    pub virtual_field: Field,
}

impl fmt::Debug for ComputedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedField")
            .field("id", &self.id)
            .field("computed_type", &self.computed_type)
            .field("params", &self.params)
            .field("field_type", &self.virtual_field.field_type)
            .finish()
    }
}

impl ComputedField {
    /// Compute this field's value; `lookup` resolves sibling fields
    pub fn compute(&self, lookup: &dyn Fn(&str) -> Option<Value>) -> Value {
        self.plugin.compute(&self.params, lookup)
    }
}

/// A computed field whose type is not known yet
struct Declaration {
    id: String,
    computed_type: String,
    plugin: Arc<dyn ComputedFieldType>,
    params: Value,
}

struct Resolver<'a> {
    declarations: BTreeMap<String, Declaration>,
    real_fields: &'a HashMap<String, Field>,
    plugins: &'a PluginRegistry,
    grants: &'a [Grant],
    resolved: HashMap<String, ComputedField>,
    stack: Vec<String>,
}

impl Resolver<'_> {
    /// Field type key of `name`, resolving computed fields on the way
    fn type_of(&mut self, name: &str) -> Result<String> {
        if let Some(field) = self.real_fields.get(name) {
            return Ok(field.field_type.clone());
        }
        self.resolve(name)
            .map(|computed| computed.virtual_field.field_type.clone())
    }

    fn resolve(&mut self, name: &str) -> Result<&ComputedField> {
        if self.resolved.contains_key(name) {
            return self
                .resolved
                .get(name)
                .ok_or_else(|| Error::schema(format!("computed field \"{}\" vanished", name)));
        }
        if self.stack.iter().any(|s| s == name) {
            let mut cycle = self.stack.clone();
            cycle.push(name.to_string());
            return Err(Error::schema(format!(
                "computed field cycle: {}",
                cycle.join(" -> ")
            )));
        }
        let Some(declaration) = self.declarations.get(name) else {
            return Err(Error::schema(format!(
                "computed field depends on unknown field \"{}\"",
                name
            )));
        };
        let dependencies = declaration.plugin.type_dependencies(&declaration.params);

        self.stack.push(name.to_string());
        let mut dependency_types = Vec::with_capacity(dependencies.len());
        for dependency in &dependencies {
            match self.type_of(dependency) {
                Ok(t) => dependency_types.push(t),
                Err(e) => {
                    self.stack.pop();
                    return Err(e);
                }
            }
        }
        self.stack.pop();

        let Some(declaration) = self.declarations.get(name) else {
            return Err(Error::schema(format!("unknown computed field \"{}\"", name)));
        };
        let field_type = declaration
            .plugin
            .result_type(&declaration.params, &dependency_types)?;
        let plugin = self.plugins.field_type(&field_type)?;
        let virtual_field = Field {
            id: declaration.id.clone(),
            field_type,
            is_relationship: plugin.is_relationship(),
            is_plural: plugin.is_plural(),
            plugin,
            default_at_create: None,
            default_at_update: None,
            related_types: None,
            searchable: true,
            grants: self
                .grants
                .iter()
                .filter(|g| g.covers_field(&declaration.id))
                .cloned()
                .collect(),
        };
        let computed = ComputedField {
            id: declaration.id.clone(),
            computed_type: declaration.computed_type.clone(),
            plugin: declaration.plugin.clone(),
            params: declaration.params.clone(),
            virtual_field,
        };
        Ok(self.resolved.entry(name.to_string()).or_insert(computed))
    }
}

/// Resolve every `computed-fields` model against the real fields
pub fn resolve_computed_fields(
    models: &[&Resource],
    real_fields: &HashMap<String, Field>,
    plugins: &PluginRegistry,
    grants: &[Grant],
) -> Result<HashMap<String, ComputedField>> {
    let mut declarations = BTreeMap::new();
    for model in models {
        let id = model_id(model)?.to_string();
        validate_field_name(&id)?;
        if real_fields.contains_key(&id) {
            return Err(Error::schema(format!(
                "computed field \"{}\" has the same id as a field",
                id
            )));
        }
        let computed_type = attr_str(model, "computed-field-type")
            .ok_or_else(|| Error::schema(format!("computed field \"{}\" has no computed-field-type", id)))?
            .to_string();
        let plugin = plugins.computed_field_type(&computed_type)?;
        let params = model.attribute("params").cloned().unwrap_or(Value::Null);
        declarations.insert(
            id.clone(),
            Declaration {
                id,
                computed_type,
                plugin,
                params,
            },
        );
    }

    let names: Vec<String> = declarations.keys().cloned().collect();
    let mut resolver = Resolver {
        declarations,
        real_fields,
        plugins,
        grants,
        resolved: HashMap::new(),
        stack: Vec::new(),
    };
    for name in names {
        resolver.resolve(&name)?;
    }
    Ok(resolver.resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn real_fields(registry: &PluginRegistry) -> HashMap<String, Field> {
        let model: Resource = serde_json::from_value(
            json!({"type": "fields", "id": "title", "attributes": {"field-type": "string"}}),
        )
        .unwrap();
        let title = Field::from_model(&model, registry, &HashMap::new(), &[]).unwrap();
        [("title".to_string(), title)].into_iter().collect()
    }

    fn computed(id: &str, kind: &str, field: &str) -> Resource {
        serde_json::from_value(json!({
            "type": "computed-fields",
            "id": id,
            "attributes": {"computed-field-type": kind, "params": {"field": field}}
        }))
        .unwrap()
    }

    #[test]
    fn test_chained_aliases_take_the_real_type() {
        let registry = PluginRegistry::with_builtins();
        let real = real_fields(&registry);
        let a = computed("headline", "alias", "title");
        let b = computed("banner", "alias", "headline");
        let resolved = resolve_computed_fields(&[&b, &a], &real, &registry, &[]).unwrap();
        assert_eq!(resolved["banner"].virtual_field.field_type, "string");
        assert_eq!(resolved["headline"].virtual_field.field_type, "string");
    }

    #[test]
    fn test_cycle_fails() {
        let registry = PluginRegistry::with_builtins();
        let real = real_fields(&registry);
        let a = computed("a", "alias", "b");
        let b = computed("b", "alias", "a");
        let err = resolve_computed_fields(&[&a, &b], &real, &registry, &[]).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_dependency_and_plugin() {
        let registry = PluginRegistry::with_builtins();
        let real = real_fields(&registry);
        let a = computed("a", "alias", "missing");
        assert!(resolve_computed_fields(&[&a], &real, &registry, &[]).is_err());
        let b = computed("b", "no-such-plugin", "title");
        assert!(resolve_computed_fields(&[&b], &real, &registry, &[]).is_err());
    }

    #[test]
    fn test_compute_value() {
        let registry = PluginRegistry::with_builtins();
        let real = real_fields(&registry);
        let count = computed("title-count", "count-of", "title");
        let resolved = resolve_computed_fields(&[&count], &real, &registry, &[]).unwrap();
        let field = &resolved["title-count"];
        assert_eq!(field.virtual_field.field_type, "integer");
        assert_eq!(field.compute(&|_| Some(json!(["a"]))), json!(1));
    }
}
