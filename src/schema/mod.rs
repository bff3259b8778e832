//! Schema for dochub
//!
//! The schema is built from a flat list of models:
//! - `content-types` name the fields a type has and its data source
//! - `fields` / `computed-fields` define values and their plugins
//! - `constraints` check several fields together
//! - `grants` and `groups` decide who may do what
//! - `data-sources` bind types to storage plugins
//!
//! A schema is immutable. Writing a schema model derives a new schema from
//! the post-write model set instead of patching the old one.

pub mod computed_field;
pub mod constraint;
pub mod content_type;
pub mod data_source;
pub mod field;
pub mod grant;
pub mod group;
pub mod model;
pub mod plugins;
pub mod realms;

pub use computed_field::ComputedField;
pub use constraint::Constraint;
pub use content_type::{ContentType, Fieldset, IncludesTree};
pub use data_source::DataSource;
pub use field::Field;
pub use grant::{Capability, Grant};
pub use group::Group;
pub use model::{is_schema_type, load_models};
pub use plugins::PluginRegistry;
pub use realms::Realms;

use crate::error::{Error, Result};
use crate::session::{RequestContext, UserRealms, EVERYONE};
use crate::storage::document::{DocRef, DocumentContext, PendingChange, Resource};
use field::IMPLICIT_FIELDS;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Schema {
    plugins: Arc<PluginRegistry>,
    pub types: HashMap<String, ContentType>,
    pub fields: HashMap<String, Field>,
    pub computed_fields: HashMap<String, ComputedField>,
    pub data_sources: HashMap<String, Arc<DataSource>>,
    pub grants: Vec<Grant>,
    pub groups: Vec<Group>,
    implicit_fields: HashMap<String, Field>,
    /// The models this schema was built from, in order
    models: Vec<Resource>,
}

/// Models of one schema type, rejecting duplicate ids
fn of_type<'a>(models: &'a [Resource], kind: &str) -> Result<Vec<&'a Resource>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for model in models.iter().filter(|m| m.kind == kind) {
        let id = model::model_id(model)?;
        if !seen.insert(id) {
            return Err(Error::schema(format!("duplicate {} model \"{}\"", kind, id)));
        }
        out.push(model);
    }
    Ok(out)
}

impl Schema {
    /// Build a schema from models
    ///
    /// Data sources are built first so that the schema models they
    /// contribute take part in the rest of the build.
    pub fn load(models: Vec<Resource>, plugins: Arc<PluginRegistry>) -> Result<Self> {
        for m in &models {
            if !is_schema_type(&m.kind) {
                return Err(Error::schema(format!(
                    "\"{}\" is not a schema model type",
                    m.kind
                )));
            }
        }

        let mut data_sources = HashMap::new();
        let mut contributed = Vec::new();
        for m in of_type(&models, "data-sources")? {
            let source = DataSource::from_model(m, &plugins)?;
            contributed.extend(source.static_schema_models()?);
            data_sources.insert(source.id.clone(), Arc::new(source));
        }
        let all: Vec<Resource> = models.iter().cloned().chain(contributed).collect();

        let mut default_values = HashMap::new();
        for m in of_type(&all, "default-values")? {
            default_values.insert(
                model::model_id(m)?.to_string(),
                m.attribute("value").cloned().unwrap_or(Value::Null),
            );
        }

        let grants = of_type(&all, "grants")?
            .into_iter()
            .map(Grant::from_model)
            .collect::<Result<Vec<_>>>()?;
        let groups = of_type(&all, "groups")?
            .into_iter()
            .map(Group::from_model)
            .collect::<Result<Vec<_>>>()?;

        let mut fields = HashMap::new();
        for m in of_type(&all, "fields")? {
            let field = Field::from_model(m, &plugins, &default_values, &grants)?;
            if field.is_implicit() {
                return Err(Error::schema(format!("\"{}\" is a reserved field name", field.id)));
            }
            fields.insert(field.id.clone(), field);
        }
        let computed_fields = computed_field::resolve_computed_fields(
            &of_type(&all, "computed-fields")?,
            &fields,
            &plugins,
            &grants,
        )?;

        let constraints = of_type(&all, "constraints")?
            .into_iter()
            .map(|m| Constraint::from_model(m, &plugins))
            .collect::<Result<Vec<_>>>()?;

        let mut types = HashMap::new();
        for m in of_type(&all, "content-types")? {
            let content_type = ContentType::from_model(
                m,
                &fields,
                &computed_fields,
                &grants,
                &constraints,
                &data_sources,
                &plugins,
            )?;
            types.insert(content_type.id.clone(), content_type);
        }

        for group in &groups {
            if let Some(kind) = group.types.iter().find(|t| !types.contains_key(*t)) {
                tracing::warn!(group = %group.id, type_name = %kind, "group names an unknown type");
            }
        }

        let mut implicit_fields = HashMap::new();
        for name in IMPLICIT_FIELDS {
            implicit_fields.insert(name.to_string(), Field::implicit(name, &plugins)?);
        }

        tracing::info!(
            types = types.len(),
            fields = fields.len(),
            computed_fields = computed_fields.len(),
            grants = grants.len(),
            data_sources = data_sources.len(),
            "schema loaded"
        );

        Ok(Self {
            plugins,
            types,
            fields,
            computed_fields,
            data_sources,
            grants,
            groups,
            implicit_fields,
            models,
        })
    }

    /// An empty schema with the built-in plugins
    pub fn empty() -> Result<Self> {
        Self::load(Vec::new(), Arc::new(PluginRegistry::with_builtins()))
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn models(&self) -> &[Resource] {
        &self.models
    }

    pub fn content_type(&self, name: &str) -> Option<&ContentType> {
        self.types.get(name)
    }

    /// A content type, or a 400 naming it
    pub fn require_type(&self, name: &str) -> Result<&ContentType> {
        self.content_type(name).ok_or_else(|| Error::UnknownType {
            type_name: name.to_string(),
        })
    }

    /// A field of any type by name, including computed and implicit fields
    pub fn real_or_computed_field(&self, name: &str) -> Option<&Field> {
        self.implicit_fields
            .get(name)
            .or_else(|| self.fields.get(name))
            .or_else(|| self.computed_fields.get(name).map(|c| &c.virtual_field))
    }

    /// Realms of the requester: `everyone` plus every group the user is in
    pub fn user_realms(&self, context: &RequestContext) -> UserRealms {
        let mut realms = UserRealms::new();
        realms.insert(EVERYONE.to_string());
        if let Some(user) = context.user() {
            for group in &self.groups {
                if group.test(user) {
                    realms.insert(group.id.clone());
                }
            }
        }
        realms
    }

    /// Types the requester may read resources of
    pub fn readable_types(&self, user_realms: &UserRealms) -> Vec<String> {
        let mut types: Vec<String> = self
            .types
            .values()
            .filter(|t| t.realms.may_read_resource(user_realms))
            .map(|t| t.id.clone())
            .collect();
        types.sort();
        types
    }

    /// Validate a pending change
    ///
    /// Defaults are written into the change. When the change touches a
    /// schema model the schema it would produce is built and returned, so
    /// a change that breaks the schema fails here.
    pub fn validate(
        &self,
        change: &mut PendingChange,
        context: &RequestContext,
    ) -> Result<Option<Schema>> {
        let kind = change
            .kind()
            .ok_or_else(|| Error::Other("a change needs an original or final document".into()))?
            .to_string();
        let content_type = self.require_type(&kind)?;
        let realms = self.user_realms(context);
        content_type.validate(change, &realms)?;

        if is_schema_type(&kind) {
            return self.apply_change(change).map_err(|err| match err {
                Error::InvalidSchema { .. } => err,
                other => Error::schema(other.to_string()),
            });
        }
        Ok(None)
    }

    /// The schema after `change`, or None when the model set is unchanged
    pub fn apply_change(&self, change: &PendingChange) -> Result<Option<Schema>> {
        let target = change
            .original_document
            .as_ref()
            .or(change.final_document.as_ref())
            .and_then(Resource::doc_ref);

        let mut models: Vec<Resource> = self
            .models
            .iter()
            .filter(|m| m.doc_ref() != target || target.is_none())
            .cloned()
            .collect();
        if let Some(document) = &change.final_document {
            models.push(document.clone());
        }

        let unchanged = models.len() == self.models.len()
            && models.iter().all(|m| self.models.contains(m));
        if unchanged {
            return Ok(None);
        }

        tracing::debug!(models = models.len(), "rebuilding schema");
        Schema::load(models, self.plugins.clone()).map(Some)
    }

    /// Project a document down to what the requester may see
    ///
    /// None when the primary resource may not be read at all. Included
    /// resources that may not be read are dropped.
    pub fn apply_read_authorization(
        &self,
        document: &DocumentContext,
        user_realms: &UserRealms,
    ) -> Option<DocumentContext> {
        let project = |resource: &Resource| {
            let content_type = self.content_type(&resource.kind)?;
            if !content_type.may_read_resource(resource, user_realms) {
                return None;
            }
            Some(content_type.apply_read_authorization(resource, user_realms))
        };
        let data = project(&document.data)?;
        let included = document.included.iter().filter_map(project).collect();
        Some(DocumentContext { data, included })
    }

    /// Keep only the included resources the `format` fieldset asks for
    ///
    /// Each fieldset entry names a relationship to include and, optionally,
    /// the format to apply to the resources it reaches.
    pub fn apply_fieldset(&self, document: &DocumentContext, format: &str) -> DocumentContext {
        let mut seen: HashSet<DocRef> = document.data.doc_ref().into_iter().collect();
        let mut included = Vec::new();
        self.collect_fieldset(&document.data, format, &document.included, &mut seen, &mut included, 0);
        DocumentContext {
            data: document.data.clone(),
            included,
        }
    }

    fn collect_fieldset(
        &self,
        resource: &Resource,
        format: &str,
        pool: &[Resource],
        seen: &mut HashSet<DocRef>,
        out: &mut Vec<Resource>,
        depth: usize,
    ) {
        if depth >= MAX_FIELDSET_DEPTH {
            return;
        }
        let Some(content_type) = self.content_type(&resource.kind) else {
            return;
        };
        for entry in content_type.fieldset(format) {
            for target in resource.related(&entry.field) {
                if !seen.insert(target.clone()) {
                    continue;
                }
                let Some(found) = pool.iter().find(|r| r.doc_ref().as_ref() == Some(&target)) else {
                    continue;
                };
                out.push(found.clone());
                if let Some(nested) = &entry.format {
                    self.collect_fieldset(found, nested, pool, seen, out, depth + 1);
                }
            }
        }
    }
}

/// Deepest chain of nested fieldset formats followed
const MAX_FIELDSET_DEPTH: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::document::Side;
    use serde_json::json;

    pub(crate) fn models(value: Value) -> Vec<Resource> {
        model::models_from_value(value).unwrap()
    }

    fn blog() -> Schema {
        Schema::load(
            models(json!([
                {"type": "content-types", "id": "articles", "relationships": {"fields": {"data": [
                    {"type": "fields", "id": "title"},
                    {"type": "fields", "id": "author"},
                    {"type": "computed-fields", "id": "headline"}
                ]}}},
                {"type": "content-types", "id": "people", "relationships": {"fields": {"data": [
                    {"type": "fields", "id": "name"}
                ]}}},
                {"type": "content-types", "id": "events"},
                {"type": "content-types", "id": "fields"},
                {"type": "fields", "id": "title", "attributes": {"field-type": "string"}},
                {"type": "fields", "id": "name", "attributes": {"field-type": "string"}},
                {"type": "fields", "id": "author", "attributes": {"field-type": "belongs-to"},
                 "relationships": {"related-types": {"data": [{"type": "content-types", "id": "people"}]}}},
                {"type": "computed-fields", "id": "headline",
                 "attributes": {"computed-field-type": "alias", "params": {"field": "title"}}},
                {"type": "grants", "id": "create-articles",
                 "attributes": {"may-create-resource": true, "may-read-resource": true},
                 "relationships": {"types": {"data": [{"type": "content-types", "id": "articles"}]}}},
                {"type": "grants", "id": "editors",
                 "attributes": {"may-create-resource": true, "may-update-resource": true,
                                "may-read-resource": true, "may-read-fields": true, "may-write-fields": true},
                 "relationships": {"who": {"data": {"type": "groups", "id": "editors"}}}},
                {"type": "groups", "id": "editors",
                 "attributes": {"search-query": {"filter": {"type": {"exact": "people"}, "role": {"exact": "editor"}}}}}
            ])),
            Arc::new(PluginRegistry::with_builtins()),
        )
        .unwrap()
    }

    fn editor() -> RequestContext {
        RequestContext::for_user(
            Resource::new("people", Some("e1".into())).with_attribute("role", "editor"),
        )
    }

    #[test]
    fn test_implicit_fields_always_present() {
        let schema = blog();
        let events = schema.content_type("events").unwrap();
        assert!(events.real_fields.contains_key("type"));
        assert!(events.real_fields.contains_key("id"));
        assert_eq!(schema.content_type("articles").unwrap().computed_fields.len(), 1);
    }

    #[test]
    fn test_create_under_typed_grant() {
        let schema = blog();
        let ctx = RequestContext::anonymous();

        let mut ok = PendingChange::create(Resource::new("articles", Some("1".into())));
        assert!(schema.validate(&mut ok, &ctx).unwrap().is_none());

        let mut denied = PendingChange::create(Resource::new("events", Some("1".into())));
        let err = schema.validate(&mut denied, &ctx).unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_field_without_write_grant() {
        let schema = blog();
        let ctx = RequestContext::anonymous();
        let mut change = PendingChange::create(
            Resource::new("articles", Some("1".into())).with_attribute("title", "Hi"),
        );
        let err = schema.validate(&mut change, &ctx).unwrap_err();
        assert_eq!(err.status(), 401);
        assert_eq!(err.to_string(), "You may not write field \"title\"");

        let mut as_editor = PendingChange::create(
            Resource::new("articles", Some("1".into())).with_attribute("title", "Hi"),
        );
        assert!(schema.validate(&mut as_editor, &editor()).is_ok());
    }

    #[test]
    fn test_unknown_field_and_unknown_type() {
        let schema = blog();
        let mut change = PendingChange::create(
            Resource::new("articles", Some("1".into())).with_attribute("bogus", 1),
        );
        let err = schema.validate(&mut change, &editor()).unwrap_err();
        assert_eq!(err.pointer(), Some("/data/attributes/bogus"));

        let mut unknown = PendingChange::create(Resource::new("robots", Some("1".into())));
        assert_eq!(schema.validate(&mut unknown, &editor()).unwrap_err().status(), 400);
    }

    #[test]
    fn test_update_requires_read_then_update() {
        let schema = blog();
        let original = Resource::new("articles", Some("1".into()));
        let mut change = PendingChange::update(original.clone(), original.clone());
        let err = schema
            .validate(&mut change, &RequestContext::anonymous())
            .unwrap_err();
        assert_eq!(err.status(), 401);

        let hidden = Resource::new("people", Some("p".into()));
        let mut change = PendingChange::update(hidden.clone(), hidden);
        let err = schema
            .validate(&mut change, &RequestContext::anonymous())
            .unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn test_user_realms() {
        let schema = blog();
        let anon = schema.user_realms(&RequestContext::anonymous());
        assert_eq!(anon.len(), 1);
        let realms = schema.user_realms(&editor());
        assert!(realms.contains("editors"));
    }

    #[test]
    fn test_read_authorization_projection() {
        let schema = blog();
        let doc = DocumentContext::new(
            Resource::new("articles", Some("1".into())).with_attribute("title", "Hi"),
        )
        .with_included(vec![Resource::new("people", Some("p".into()))]);

        let anon = schema.user_realms(&RequestContext::anonymous());
        let seen = schema.apply_read_authorization(&doc, &anon).unwrap();
        assert!(seen.data.attributes.is_empty());
        assert!(seen.included.is_empty());

        let realms = schema.user_realms(&editor());
        let seen = schema.apply_read_authorization(&doc, &realms).unwrap();
        assert_eq!(seen.data.attribute("title"), Some(&json!("Hi")));
        assert_eq!(seen.included.len(), 1);
    }

    #[test]
    fn test_schema_change_rebuilds() {
        let schema = blog();
        let field = Resource::new("fields", Some("summary".into())).with_attribute("field-type", "string");
        let change = PendingChange::create(field);
        let next = schema.apply_change(&change).unwrap().unwrap();
        assert!(next.fields.contains_key("summary"));
        assert!(!schema.fields.contains_key("summary"));

        let broken = Resource::new("fields", Some("oops".into())).with_attribute("field-type", "nope");
        assert!(schema.apply_change(&PendingChange::create(broken)).is_err());

        let title = schema
            .models()
            .iter()
            .find(|m| m.kind == "fields" && m.id.as_deref() == Some("title"))
            .unwrap()
            .clone();
        let same = PendingChange::update(title.clone(), title);
        assert!(schema.apply_change(&same).unwrap().is_none());
    }

    #[test]
    fn test_defaults_written_into_change() {
        let schema = Schema::load(
            models(json!([
                {"type": "content-types", "id": "articles", "relationships": {"fields": {"data": [
                    {"type": "fields", "id": "status"}
                ]}}},
                {"type": "fields", "id": "status", "attributes": {"field-type": "string"},
                 "relationships": {"default-at-create": {"data": {"type": "default-values", "id": "draft"}}}},
                {"type": "default-values", "id": "draft", "attributes": {"value": "draft"}},
                {"type": "grants", "id": "all", "attributes": {"may-create-resource": true}}
            ])),
            Arc::new(PluginRegistry::with_builtins()),
        )
        .unwrap();
        let mut change = PendingChange::create(Resource::new("articles", Some("1".into())));
        schema.validate(&mut change, &RequestContext::anonymous()).unwrap();
        let status = schema.content_type("articles").unwrap().real_fields["status"]
            .value_from(&change, Side::Final);
        assert_eq!(status, Some(json!("draft")));
    }

    #[test]
    fn test_fieldsets_pick_included() {
        let schema = Schema::load(
            models(json!([
                {"type": "content-types", "id": "articles",
                 "attributes": {"fieldsets": {"summary": [{"field": "author", "format": "card"}]}},
                 "relationships": {"fields": {"data": [
                    {"type": "fields", "id": "author"},
                    {"type": "fields", "id": "editor"}
                 ]}}},
                {"type": "content-types", "id": "people",
                 "attributes": {"fieldsets": {"card": [{"field": "team"}]}},
                 "relationships": {"fields": {"data": [{"type": "fields", "id": "team"}]}}},
                {"type": "content-types", "id": "teams"},
                {"type": "fields", "id": "author", "attributes": {"field-type": "belongs-to"}},
                {"type": "fields", "id": "editor", "attributes": {"field-type": "belongs-to"}},
                {"type": "fields", "id": "team", "attributes": {"field-type": "belongs-to"}}
            ])),
            Arc::new(PluginRegistry::with_builtins()),
        )
        .unwrap();
        let doc = DocumentContext::new(
            Resource::new("articles", Some("1".into()))
                .with_relationship("author", json!({"type": "people", "id": "p1"}))
                .with_relationship("editor", json!({"type": "people", "id": "p2"})),
        )
        .with_included(vec![
            Resource::new("people", Some("p1".into()))
                .with_relationship("team", json!({"type": "teams", "id": "t1"})),
            Resource::new("people", Some("p2".into())),
            Resource::new("teams", Some("t1".into())),
        ]);

        let summary = schema.apply_fieldset(&doc, "summary");
        let ids: Vec<_> = summary.included.iter().filter_map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["p1".to_string(), "t1".to_string()]);
        assert!(schema.apply_fieldset(&doc, "unknown").included.is_empty());
    }

    #[test]
    fn test_load_errors() {
        let plugins = Arc::new(PluginRegistry::with_builtins());
        let dup = models(json!([
            {"type": "content-types", "id": "a"},
            {"type": "content-types", "id": "a"}
        ]));
        assert!(Schema::load(dup, plugins.clone()).is_err());

        let missing = models(json!([
            {"type": "content-types", "id": "a", "relationships": {"fields": {"data": [{"type": "fields", "id": "nope"}]}}}
        ]));
        assert!(Schema::load(missing, plugins.clone()).is_err());

        let content = models(json!([{"type": "articles", "id": "1"}]));
        assert!(Schema::load(content, plugins).is_err());
    }
}
