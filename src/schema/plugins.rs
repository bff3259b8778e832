//! Plugin registry
//!
//! Field types, computed field types, constraint types and data-source types
//! are looked up by string key while the schema loads. The registry is
//! built once at startup; an unknown key fails the schema load.

use crate::error::{Error, Result};
use crate::session::Session;
use crate::storage::document::{DocRef, DocumentContext, PendingChange, Resource};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a plugin validity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    Valid,
    /// Invalid, use the generic message
    Invalid,
    /// Invalid with a plugin-supplied message
    Reason(String),
}

impl Validity {
    pub fn from_bool(ok: bool) -> Self {
        if ok {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}

// =============================================================================
// Field types
// =============================================================================

/// Behavior of one kind of field
pub trait FieldType: Send + Sync {
    /// True if values live under `relationships`
    fn is_relationship(&self) -> bool {
        false
    }

    /// True if values are lists
    fn is_plural(&self) -> bool {
        false
    }

    /// Check a non-null value
    fn valid(&self, value: &Value) -> Validity;

    /// The value used when a field has no configured default
    fn default_value(&self) -> Option<Value> {
        None
    }

    /// Turn a configured default into the stored value
    fn generate_default(&self, value: &Value) -> Value {
        value.clone()
    }

    /// Postgres type that values should be compared as
    fn sql_cast(&self) -> Option<&'static str> {
        None
    }

    /// True if `text` may be bound as a comparison operand for this type
    fn valid_sql_literal(&self, text: &str) -> bool {
        self.sql_cast().map_or(true, |cast| literal_fits_cast(cast, text))
    }

    /// Shape of the value in the search document
    fn search_index_format(&self, value: &Value) -> Value {
        value.clone()
    }
}

/// True if Postgres will accept `text` cast to `cast`
///
/// Dates must be `YYYY-MM-DD`.
pub fn literal_fits_cast(cast: &str, text: &str) -> bool {
    let text = text.trim();
    match cast {
        "numeric" => text.parse::<f64>().map_or(false, f64::is_finite),
        "boolean" => matches!(
            text.to_ascii_lowercase().as_str(),
            "t" | "true" | "y" | "yes" | "on" | "1" | "f" | "false" | "n" | "no" | "off" | "0"
        ),
        "date" => chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok(),
        _ => true,
    }
}

struct StringType;

impl FieldType for StringType {
    fn valid(&self, value: &Value) -> Validity {
        Validity::from_bool(value.is_string())
    }
}

struct StringArrayType;

impl FieldType for StringArrayType {
    fn is_plural(&self) -> bool {
        true
    }

    fn valid(&self, value: &Value) -> Validity {
        match value {
            Value::Array(items) if items.iter().all(Value::is_string) => Validity::Valid,
            Value::Array(_) => Validity::Reason("every item must be a string".into()),
            _ => Validity::Invalid,
        }
    }
}

struct IntegerType;

impl FieldType for IntegerType {
    fn valid(&self, value: &Value) -> Validity {
        Validity::from_bool(value.is_i64() || value.is_u64())
    }

    fn sql_cast(&self) -> Option<&'static str> {
        Some("numeric")
    }
}

struct BooleanType;

impl FieldType for BooleanType {
    fn valid(&self, value: &Value) -> Validity {
        Validity::from_bool(value.is_boolean())
    }

    fn sql_cast(&self) -> Option<&'static str> {
        Some("boolean")
    }
}

struct DateType;

impl FieldType for DateType {
    fn valid(&self, value: &Value) -> Validity {
        match value.as_str() {
            Some(s) if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() => Validity::Valid,
            Some(_) => Validity::Reason("dates must be formatted YYYY-MM-DD".into()),
            None => Validity::Invalid,
        }
    }

    /// `"now"` becomes today's date
    fn generate_default(&self, value: &Value) -> Value {
        match value.as_str() {
            Some("now") => Value::String(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            _ => value.clone(),
        }
    }

    fn sql_cast(&self) -> Option<&'static str> {
        Some("date")
    }
}

struct ObjectType;

impl FieldType for ObjectType {
    fn valid(&self, value: &Value) -> Validity {
        Validity::from_bool(value.is_object())
    }
}

struct AnyType;

impl FieldType for AnyType {
    fn valid(&self, _value: &Value) -> Validity {
        Validity::Valid
    }
}

struct BelongsToType;

impl FieldType for BelongsToType {
    fn is_relationship(&self) -> bool {
        true
    }

    fn valid(&self, value: &Value) -> Validity {
        Validity::from_bool(DocRef::from_identifier(value).is_some())
    }

    fn search_index_format(&self, value: &Value) -> Value {
        DocRef::from_identifier(value)
            .map(|r| r.to_identifier())
            .unwrap_or(Value::Null)
    }
}

struct HasManyType;

impl FieldType for HasManyType {
    fn is_relationship(&self) -> bool {
        true
    }

    fn is_plural(&self) -> bool {
        true
    }

    fn valid(&self, value: &Value) -> Validity {
        match value {
            Value::Array(items) if items.iter().all(|i| DocRef::from_identifier(i).is_some()) => {
                Validity::Valid
            }
            Value::Array(_) => Validity::Reason("every item must be a resource identifier".into()),
            _ => Validity::Invalid,
        }
    }

    fn default_value(&self) -> Option<Value> {
        Some(Value::Array(Vec::new()))
    }
}

// =============================================================================
// Computed field types
// =============================================================================

/// A derived, read-only field
pub trait ComputedFieldType: Send + Sync {
    /// Fields whose types the result type depends on
    fn type_dependencies(&self, params: &Value) -> Vec<String>;

    /// Field type key of the result, given the resolved types of the
    /// dependencies (same order as `type_dependencies`)
    fn result_type(&self, params: &Value, dependency_types: &[String]) -> Result<String>;

    /// Compute the value; `lookup` resolves any other field's value
    fn compute(&self, params: &Value, lookup: &dyn Fn(&str) -> Option<Value>) -> Value;
}

fn param_field(params: &Value) -> Option<String> {
    params.get("field").and_then(Value::as_str).map(String::from)
}

/// Mirrors another field, including its type
struct AliasComputed;

impl ComputedFieldType for AliasComputed {
    fn type_dependencies(&self, params: &Value) -> Vec<String> {
        param_field(params).into_iter().collect()
    }

    fn result_type(&self, params: &Value, dependency_types: &[String]) -> Result<String> {
        dependency_types
            .first()
            .cloned()
            .ok_or_else(|| Error::schema(format!("alias needs a \"field\" parameter: {}", params)))
    }

    fn compute(&self, params: &Value, lookup: &dyn Fn(&str) -> Option<Value>) -> Value {
        param_field(params)
            .and_then(|f| lookup(&f))
            .unwrap_or(Value::Null)
    }
}

/// Number of items in another field
struct CountOfComputed;

impl ComputedFieldType for CountOfComputed {
    fn type_dependencies(&self, _params: &Value) -> Vec<String> {
        Vec::new()
    }

    fn result_type(&self, params: &Value, _dependency_types: &[String]) -> Result<String> {
        if param_field(params).is_none() {
            return Err(Error::schema("count-of needs a \"field\" parameter"));
        }
        Ok("integer".to_string())
    }

    fn compute(&self, params: &Value, lookup: &dyn Fn(&str) -> Option<Value>) -> Value {
        let count = match param_field(params).and_then(|f| lookup(&f)) {
            Some(Value::Array(items)) => items.len(),
            _ => 0,
        };
        Value::from(count as u64)
    }
}

// =============================================================================
// Constraint types
// =============================================================================

/// One named input of a constraint, bound to a field
#[derive(Debug, Clone)]
pub struct ConstraintInput<'a> {
    pub name: &'a str,
    pub field: &'a str,
    pub value: &'a Value,
}

/// A check over one or more fields together
pub trait ConstraintType: Send + Sync {
    /// Input names the constraint requires
    fn inputs(&self) -> &'static [&'static str];

    /// Reject bad parameters while the schema loads
    fn check_parameters(&self, _parameters: &Value) -> Result<()> {
        Ok(())
    }

    /// A validator specialized to `parameters`, built once at schema load
    ///
    /// `None` keeps using this plugin as registered.
    fn prepare(&self, parameters: &Value) -> Result<Option<Arc<dyn ConstraintType>>> {
        self.check_parameters(parameters).map(|_| None)
    }

    /// Check the bound inputs; `Reason` carries the user-facing message
    fn valid(&self, inputs: &[ConstraintInput<'_>], parameters: &Value) -> Validity;
}

struct NotNullConstraint;

impl ConstraintType for NotNullConstraint {
    fn inputs(&self) -> &'static [&'static str] {
        &["target"]
    }

    fn valid(&self, inputs: &[ConstraintInput<'_>], _parameters: &Value) -> Validity {
        match inputs.iter().find(|i| i.value.is_null()) {
            Some(input) => Validity::Reason(format!(
                "the value of field \"{}\" may not be null",
                input.field
            )),
            None => Validity::Valid,
        }
    }
}

struct NotEmptyConstraint;

impl ConstraintType for NotEmptyConstraint {
    fn inputs(&self) -> &'static [&'static str] {
        &["target"]
    }

    fn valid(&self, inputs: &[ConstraintInput<'_>], _parameters: &Value) -> Validity {
        let empty = |v: &Value| match v {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        };
        match inputs.iter().find(|i| empty(i.value)) {
            Some(input) => Validity::Reason(format!("the field \"{}\" may not be empty", input.field)),
            None => Validity::Valid,
        }
    }
}

struct MaxLengthConstraint;

impl MaxLengthConstraint {
    fn max(parameters: &Value) -> Option<u64> {
        parameters.get("max").and_then(Value::as_u64)
    }
}

impl ConstraintType for MaxLengthConstraint {
    fn inputs(&self) -> &'static [&'static str] {
        &["target"]
    }

    fn check_parameters(&self, parameters: &Value) -> Result<()> {
        Self::max(parameters)
            .map(|_| ())
            .ok_or_else(|| Error::schema("max-length needs a numeric \"max\" parameter"))
    }

    fn valid(&self, inputs: &[ConstraintInput<'_>], parameters: &Value) -> Validity {
        let max = Self::max(parameters).unwrap_or(u64::MAX);
        for input in inputs {
            let len = match input.value {
                Value::String(s) => s.chars().count() as u64,
                Value::Array(a) => a.len() as u64,
                _ => continue,
            };
            if len > max {
                return Validity::Reason(format!(
                    "the field \"{}\" may be at most {} long",
                    input.field, max
                ));
            }
        }
        Validity::Valid
    }
}

/// Regex match on string inputs; the pattern is compiled by `prepare`
#[derive(Default)]
struct MatchesConstraint {
    pattern: Option<regex::Regex>,
}

impl MatchesConstraint {
    fn pattern(parameters: &Value) -> Result<regex::Regex> {
        let source = parameters
            .get("pattern")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::schema("matches needs a \"pattern\" parameter"))?;
        regex::Regex::new(source).map_err(|e| Error::schema(format!("bad pattern: {}", e)))
    }
}

impl ConstraintType for MatchesConstraint {
    fn inputs(&self) -> &'static [&'static str] {
        &["target"]
    }

    fn check_parameters(&self, parameters: &Value) -> Result<()> {
        Self::pattern(parameters).map(|_| ())
    }

    fn prepare(&self, parameters: &Value) -> Result<Option<Arc<dyn ConstraintType>>> {
        let pattern = Self::pattern(parameters)?;
        Ok(Some(Arc::new(MatchesConstraint {
            pattern: Some(pattern),
        })))
    }

    fn valid(&self, inputs: &[ConstraintInput<'_>], _parameters: &Value) -> Validity {
        let Some(pattern) = &self.pattern else {
            return Validity::Reason("matches constraint used without a compiled pattern".into());
        };
        for input in inputs {
            if let Some(s) = input.value.as_str() {
                if !pattern.is_match(s) {
                    return Validity::Reason(format!(
                        "the field \"{}\" must match {}",
                        input.field,
                        pattern.as_str()
                    ));
                }
            }
        }
        Validity::Valid
    }
}

// =============================================================================
// Data-source types
// =============================================================================

/// Turns requests into pending changes for one storage backend
#[async_trait]
pub trait Writer: Send + Sync {
    async fn prepare_create(
        &self,
        branch: &str,
        session: Option<&Session>,
        document: Resource,
    ) -> Result<PendingChange>;

    async fn prepare_update(
        &self,
        branch: &str,
        session: Option<&Session>,
        original: Resource,
        document: Resource,
    ) -> Result<PendingChange>;

    async fn prepare_delete(
        &self,
        branch: &str,
        session: Option<&Session>,
        original: Resource,
    ) -> Result<PendingChange>;
}

/// What one indexing pass over a source produced
#[derive(Debug, Clone, Default)]
pub struct IndexUpdate {
    /// Documents to (re)index
    pub documents: Vec<DocumentContext>,
    /// Documents known to be gone
    pub removed: Vec<DocRef>,
    /// True if `documents` is the complete content of the source, so
    /// anything not re-saved in this pass is stale
    pub complete: bool,
    /// Source-specific progress marker, handed back on the next pass
    pub meta: Value,
}

/// Reads upstream content for indexing
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn branches(&self) -> Result<Vec<String>>;

    async fn update_content(&self, branch: &str, last_meta: Option<&Value>) -> Result<IndexUpdate>;
}

/// Source-specific lookups that bypass the shared index
#[async_trait]
pub trait SourceSearcher: Send + Sync {
    async fn get(&self, branch: &str, kind: &str, id: &str) -> Result<Option<DocumentContext>>;
}

/// Exchanges a login payload for a user
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, payload: &Value) -> Result<Option<Resource>>;
}

/// Factory for one kind of data source
pub trait DataSourceType: Send + Sync {
    fn create_writer(&self, _params: &Value) -> Result<Option<Arc<dyn Writer>>> {
        Ok(None)
    }

    fn create_indexer(&self, _params: &Value) -> Result<Option<Arc<dyn Indexer>>> {
        Ok(None)
    }

    fn create_searcher(&self, _params: &Value) -> Result<Option<Arc<dyn SourceSearcher>>> {
        Ok(None)
    }

    fn create_authenticator(&self, _params: &Value) -> Result<Option<Arc<dyn Authenticator>>> {
        Ok(None)
    }

    /// Content models this source always provides
    fn static_models(&self, _params: &Value) -> Result<Vec<Resource>> {
        Ok(Vec::new())
    }

    /// Schema models this source contributes
    fn static_schema_models(&self, _params: &Value) -> Result<Vec<Resource>> {
        Ok(Vec::new())
    }
}

/// Serves models listed in its params: `models` and `schema`
struct StaticSource;

impl StaticSource {
    fn read(params: &Value, key: &str) -> Result<Vec<Resource>> {
        match params.get(key) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => crate::schema::model::models_from_value(value.clone()),
        }
    }
}

impl DataSourceType for StaticSource {
    fn static_models(&self, params: &Value) -> Result<Vec<Resource>> {
        Self::read(params, "models")
    }

    fn static_schema_models(&self, params: &Value) -> Result<Vec<Resource>> {
        Self::read(params, "schema")
    }
}

// =============================================================================
// Registry
// =============================================================================

/// All plugins known to this process
#[derive(Clone, Default)]
pub struct PluginRegistry {
    field_types: HashMap<String, Arc<dyn FieldType>>,
    computed_field_types: HashMap<String, Arc<dyn ComputedFieldType>>,
    constraint_types: HashMap<String, Arc<dyn ConstraintType>>,
    data_source_types: HashMap<String, Arc<dyn DataSourceType>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = |m: Vec<&String>| {
            let mut k: Vec<_> = m.into_iter().cloned().collect();
            k.sort();
            k
        };
        f.debug_struct("PluginRegistry")
            .field("field_types", &keys(self.field_types.keys().collect()))
            .field("computed_field_types", &keys(self.computed_field_types.keys().collect()))
            .field("constraint_types", &keys(self.constraint_types.keys().collect()))
            .field("data_source_types", &keys(self.data_source_types.keys().collect()))
            .finish()
    }
}

impl PluginRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in plugins
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register_field_type("string", StringType)
            .register_field_type("string-array", StringArrayType)
            .register_field_type("integer", IntegerType)
            .register_field_type("boolean", BooleanType)
            .register_field_type("date", DateType)
            .register_field_type("object", ObjectType)
            .register_field_type("any", AnyType)
            .register_field_type("belongs-to", BelongsToType)
            .register_field_type("has-many", HasManyType)
            .register_computed_field_type("alias", AliasComputed)
            .register_computed_field_type("count-of", CountOfComputed)
            .register_constraint_type("not-null", NotNullConstraint)
            .register_constraint_type("not-empty", NotEmptyConstraint)
            .register_constraint_type("max-length", MaxLengthConstraint)
            .register_constraint_type("matches", MatchesConstraint::default())
            .register_data_source_type("static", StaticSource);
        registry
    }

    pub fn register_field_type(&mut self, key: &str, plugin: impl FieldType + 'static) -> &mut Self {
        self.field_types.insert(key.to_string(), Arc::new(plugin));
        self
    }

    pub fn register_computed_field_type(
        &mut self,
        key: &str,
        plugin: impl ComputedFieldType + 'static,
    ) -> &mut Self {
        self.computed_field_types.insert(key.to_string(), Arc::new(plugin));
        self
    }

    pub fn register_constraint_type(
        &mut self,
        key: &str,
        plugin: impl ConstraintType + 'static,
    ) -> &mut Self {
        self.constraint_types.insert(key.to_string(), Arc::new(plugin));
        self
    }

    pub fn register_data_source_type(
        &mut self,
        key: &str,
        plugin: impl DataSourceType + 'static,
    ) -> &mut Self {
        self.data_source_types.insert(key.to_string(), Arc::new(plugin));
        self
    }

    pub fn field_type(&self, key: &str) -> Result<Arc<dyn FieldType>> {
        self.field_types.get(key).cloned().ok_or_else(|| Error::UnknownPlugin {
            kind: "field-type",
            key: key.to_string(),
        })
    }

    pub fn computed_field_type(&self, key: &str) -> Result<Arc<dyn ComputedFieldType>> {
        self.computed_field_types
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownPlugin {
                kind: "computed-field-type",
                key: key.to_string(),
            })
    }

    pub fn constraint_type(&self, key: &str) -> Result<Arc<dyn ConstraintType>> {
        self.constraint_types
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownPlugin {
                kind: "constraint-type",
                key: key.to_string(),
            })
    }

    pub fn data_source_type(&self, key: &str) -> Result<Arc<dyn DataSourceType>> {
        self.data_source_types
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownPlugin {
                kind: "data-source-type",
                key: key.to_string(),
            })
    }
}
