//! Data sources
//!
//! A data source binds content types to a storage plugin. Plugin instances
//! (writer, indexer, searcher, authenticator) are created on first use and
//! reused after that.

use super::model::{attr_bool, attr_str, model_id};
use super::plugins::{Authenticator, DataSourceType, Indexer, PluginRegistry, SourceSearcher, Writer};
use crate::error::{Error, Result};
use crate::storage::document::Resource;
use crate::validation::{validate_source_id, SCOPE_SEPARATOR};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Default lifetime of authentication tokens
pub const DEFAULT_TOKEN_EXPIRY_SECONDS: u64 = 86_400;

#[derive(Clone)]
pub struct DataSource {
    pub id: String,
    pub source_type: String,
    pub params: Value,
    pub may_create_user: bool,
    pub may_update_user: bool,
    pub token_expiry_seconds: u64,
    plugin: Arc<dyn DataSourceType>,
    writer: OnceLock<Option<Arc<dyn Writer>>>,
    indexer: OnceLock<Option<Arc<dyn Indexer>>>,
    searcher: OnceLock<Option<Arc<dyn SourceSearcher>>>,
    authenticator: OnceLock<Option<Arc<dyn Authenticator>>>,
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSource")
            .field("id", &self.id)
            .field("source_type", &self.source_type)
            .field("may_create_user", &self.may_create_user)
            .field("may_update_user", &self.may_update_user)
            .field("token_expiry_seconds", &self.token_expiry_seconds)
            .finish()
    }
}

/// Return the cached instance, creating it with `create` the first time
fn memoized<T: Clone>(
    cell: &OnceLock<Option<T>>,
    create: impl FnOnce() -> Result<Option<T>>,
) -> Result<Option<T>> {
    if let Some(instance) = cell.get() {
        return Ok(instance.clone());
    }
    let instance = create()?;
    Ok(cell.get_or_init(|| instance).clone())
}

impl DataSource {
    pub fn from_model(model: &Resource, plugins: &PluginRegistry) -> Result<Self> {
        let id = model_id(model)?.to_string();
        validate_source_id(&id)?;
        let source_type = attr_str(model, "source-type")
            .ok_or_else(|| Error::schema(format!("data source \"{}\" has no source-type", id)))?
            .to_string();
        let plugin = plugins.data_source_type(&source_type)?;
        let token_expiry_seconds = match model.attribute("token-expiry-seconds") {
            None | Some(Value::Null) => DEFAULT_TOKEN_EXPIRY_SECONDS,
            Some(v) => v.as_u64().ok_or_else(|| {
                Error::schema(format!(
                    "data source \"{}\" token-expiry-seconds must be a positive integer",
                    id
                ))
            })?,
        };

        Ok(Self {
            params: model.attribute("params").cloned().unwrap_or(Value::Null),
            may_create_user: attr_bool(model, "may-create-user", false),
            may_update_user: attr_bool(model, "may-update-user", false),
            token_expiry_seconds,
            id,
            source_type,
            plugin,
            writer: OnceLock::new(),
            indexer: OnceLock::new(),
            searcher: OnceLock::new(),
            authenticator: OnceLock::new(),
        })
    }

    pub fn writer(&self) -> Result<Option<Arc<dyn Writer>>> {
        memoized(&self.writer, || self.plugin.create_writer(&self.params))
    }

    pub fn indexer(&self) -> Result<Option<Arc<dyn Indexer>>> {
        memoized(&self.indexer, || self.plugin.create_indexer(&self.params))
    }

    pub fn searcher(&self) -> Result<Option<Arc<dyn SourceSearcher>>> {
        memoized(&self.searcher, || self.plugin.create_searcher(&self.params))
    }

    pub fn authenticator(&self) -> Result<Option<Arc<dyn Authenticator>>> {
        memoized(&self.authenticator, || {
            self.plugin.create_authenticator(&self.params)
        })
    }

    /// Content this source always provides
    pub fn static_models(&self) -> Result<Vec<Resource>> {
        self.plugin.static_models(&self.params)
    }

    /// Schema models contributed by this source
    ///
    /// A non-empty contribution holds exactly one `card-definitions` model,
    /// whose id is `<source id>::<package name>`; every other model's id must
    /// be scoped under that id.
    pub fn static_schema_models(&self) -> Result<Vec<Resource>> {
        let models = self.plugin.static_schema_models(&self.params)?;
        if models.is_empty() {
            return Ok(models);
        }

        let definitions: Vec<&Resource> = models
            .iter()
            .filter(|m| m.kind == "card-definitions")
            .collect();
        let definition = match definitions.as_slice() {
            [one] => *one,
            _ => {
                return Err(Error::schema(format!(
                    "data source \"{}\" must contribute exactly one card-definitions model, found {}",
                    self.id,
                    definitions.len()
                )))
            }
        };

        let definition_id = model_id(definition)?;
        let package = definition_id
            .strip_prefix(&self.id)
            .and_then(|rest| rest.strip_prefix(SCOPE_SEPARATOR))
            .filter(|package| !package.is_empty() && !package.contains(SCOPE_SEPARATOR));
        if package.is_none() {
            return Err(Error::schema(format!(
                "card definition \"{}\" must be named \"{}{}<package>\"",
                definition_id, self.id, SCOPE_SEPARATOR
            )));
        }

        let scope = format!("{}{}", definition_id, SCOPE_SEPARATOR);
        for model in &models {
            if model.kind == "card-definitions" {
                continue;
            }
            let id = model_id(model)?;
            if !id.starts_with(&scope) || id.len() == scope.len() {
                return Err(Error::schema(format!(
                    "{} \"{}\" from data source \"{}\" must be scoped under \"{}\"",
                    model.kind, id, self.id, scope
                )));
            }
        }

        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn source(params: Value) -> DataSource {
        let model: Resource = serde_json::from_value(json!({
            "type": "data-sources",
            "id": "local",
            "attributes": {"source-type": "static", "params": params}
        }))
        .unwrap();
        DataSource::from_model(&model, &PluginRegistry::with_builtins()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let ds = source(Value::Null);
        assert_eq!(ds.token_expiry_seconds, DEFAULT_TOKEN_EXPIRY_SECONDS);
        assert!(!ds.may_create_user);
        assert!(ds.writer().unwrap().is_none());
        assert!(ds.static_schema_models().unwrap().is_empty());
    }

    #[test]
    fn test_scoped_schema_models() {
        let ds = source(json!({"schema": [
            {"type": "card-definitions", "id": "local::blog"},
            {"type": "fields", "id": "local::blog::title", "attributes": {"field-type": "string"}}
        ]}));
        assert_eq!(ds.static_schema_models().unwrap().len(), 2);
    }

    #[test]
    fn test_unscoped_schema_model_fails() {
        let ds = source(json!({"schema": [
            {"type": "card-definitions", "id": "local::blog"},
            {"type": "fields", "id": "title", "attributes": {"field-type": "string"}}
        ]}));
        assert!(ds.static_schema_models().is_err());

        let two = source(json!({"schema": [
            {"type": "card-definitions", "id": "local::a"},
            {"type": "card-definitions", "id": "local::b"}
        ]}));
        assert!(two.static_schema_models().is_err());

        let misnamed = source(json!({"schema": [{"type": "card-definitions", "id": "other::a"}]}));
        assert!(misnamed.static_schema_models().is_err());
    }

    #[test]
    fn test_memoized_creates_once() {
        let calls = AtomicUsize::new(0);
        let cell: OnceLock<Option<Arc<u32>>> = OnceLock::new();
        for _ in 0..3 {
            let v = memoized(&cell, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Arc::new(7)))
            })
            .unwrap();
            assert_eq!(v.as_deref(), Some(&7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
