//! dochub - schema-driven document hub
//!
//! Documents are JSON:API resources. A schema, itself made of JSON:API
//! models, decides which fields each type has, who may create, read,
//! update or delete what, and how documents are indexed for search.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                              Hub                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌──────────────────┐  ┌─────────────────────┐ │
//! │  │   hubql     │  │     Schema       │  │   Plugin Registry   │ │
//! │  │  (filter,   │  │ (types, fields,  │  │ (field, constraint, │ │
//! │  │ sort, page) │  │ grants, groups)  │  │  data-source types) │ │
//! │  └──────┬──────┘  └────────┬─────────┘  └──────────┬──────────┘ │
//! │         │                  │                       │            │
//! │         ▼                  ▼                       ▼            │
//! │  ┌─────────────────┐  ┌──────────────────────────────────────┐  │
//! │  │ Query compiler  │  │ Validation pipeline                  │  │
//! │  │ (SQL + keyset   │  │ (authorize, defaults, fields,        │  │
//! │  │  pagination)    │  │  constraints, schema self-check)     │  │
//! │  └────────┬────────┘  └──────────────────┬───────────────────┘  │
//! │           │                              │                      │
//! │           ▼                              ▼                      │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │  Postgres: documents(branch, type, id, search_doc, ...)     ││
//! │  │            meta(branch, id, params)                         ││
//! │  └─────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod query;
pub mod schema;
pub mod session;
pub mod storage;
pub mod validation;

pub use config::HubConfig;
pub use error::{Error, Result};
pub use query::{SearchPage, Searcher};
pub use schema::{PluginRegistry, Schema};
pub use session::{RequestContext, Session};
pub use storage::document::{DocRef, DocumentContext, PendingChange, Resource};

use anyhow::Context;
use schema::model::SCHEMA_TYPES;
use schema::plugins::IndexUpdate;
use schema::ContentType;
use std::sync::Arc;
use storage::{Indexers, PgClient};
use tokio::sync::{Mutex, RwLock};

/// Source name for types without a data source
pub const DEFAULT_SOURCE: &str = "default";

/// The main hub handle
pub struct Hub {
    config: HubConfig,
    client: PgClient,
    indexers: Indexers,
    searcher: Searcher,
    /// Replaced whole when a write changes a schema model
    schema: RwLock<Arc<Schema>>,
    /// Held from validation to swap by writes of schema models
    schema_writes: Mutex<()>,
}

impl Hub {
    /// Connect with the built-in plugins
    pub async fn open(config: HubConfig) -> anyhow::Result<Self> {
        Self::open_with_plugins(config, Arc::new(PluginRegistry::with_builtins())).await
    }

    /// Connect, create missing tables and load the schema
    ///
    /// Schema models come from `schema_dir`; models stored in the default
    /// branch replace file models with the same type and id.
    pub async fn open_with_plugins(
        config: HubConfig,
        plugins: Arc<PluginRegistry>,
    ) -> anyhow::Result<Self> {
        config.check()?;
        let client = PgClient::connect(config.require_database_url()?, config.max_connections)
            .await
            .context("Failed to connect to postgres")?
            .with_batch_sizes(config.reference_id_batch_size, config.reference_row_batch_size);
        client
            .ensure_database()
            .await
            .context("Failed to create tables")?;

        let mut models = match &config.schema_dir {
            Some(dir) => schema::load_models(dir)
                .with_context(|| format!("Failed to load schema models from {}", dir.display()))?,
            None => Vec::new(),
        };
        let kinds: Vec<String> = SCHEMA_TYPES.iter().map(|k| k.to_string()).collect();
        for stored in client.documents_of_types(&config.default_branch, &kinds).await? {
            let document: DocumentContext = serde_json::from_value(stored)?;
            let key = document.data.doc_ref();
            models.retain(|m| m.doc_ref() != key);
            models.push(document.data);
        }

        let schema = Schema::load(models, plugins).context("Failed to load schema")?;
        Ok(Self::from_parts(config, client, schema))
    }

    /// Assemble a hub from already-built parts
    pub fn from_parts(config: HubConfig, client: PgClient, schema: Schema) -> Self {
        Self {
            searcher: Searcher::new(config.page_size, config.max_page_size),
            indexers: Indexers::new(client.clone()),
            client,
            config,
            schema: RwLock::new(Arc::new(schema)),
            schema_writes: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn client(&self) -> &PgClient {
        &self.client
    }

    pub fn searcher(&self) -> &Searcher {
        &self.searcher
    }

    /// The current schema
    pub async fn schema(&self) -> Arc<Schema> {
        self.schema.read().await.clone()
    }

    /// Source rows of this type are stamped with
    pub fn source_id(content_type: &ContentType) -> String {
        content_type
            .data_source
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_else(|| DEFAULT_SOURCE.to_string())
    }

    /// The stored document for `target`, unauthorized
    async fn stored(&self, branch: &str, target: &DocRef) -> Result<Option<DocumentContext>> {
        match self.client.get(branch, &target.kind, &target.id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn current_generation(&self, branch: &str, source: &str) -> Result<Option<i64>> {
        Ok(self
            .indexers
            .source_meta(branch, source)
            .await?
            .and_then(|meta| meta.get("generation").and_then(serde_json::Value::as_i64)))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Validate and persist a pending change
    ///
    /// Returns the written document as the requester may see it (None on
    /// delete). A change to a schema model swaps in the schema it produces;
    /// such changes are only accepted on the default branch and run one at
    /// a time.
    pub async fn write(
        &self,
        branch: &str,
        mut change: PendingChange,
        context: &RequestContext,
    ) -> Result<Option<DocumentContext>> {
        let kind = change
            .kind()
            .ok_or_else(|| Error::Other("a change needs an original or final document".into()))?
            .to_string();
        let _schema_write = if schema::is_schema_type(&kind) {
            if branch != self.config.default_branch {
                return Err(Error::schema(format!(
                    "schema models may only be written on branch \"{}\"",
                    self.config.default_branch
                )));
            }
            Some(self.schema_writes.lock().await)
        } else {
            None
        };

        let current = self.schema().await;
        let next = current.validate(&mut change, context)?.map(Arc::new);
        let schema = next.clone().unwrap_or_else(|| current.clone());

        let source = Self::source_id(schema.require_type(&kind)?);
        let generation = self.current_generation(branch, &source).await?;

        let written = match change.final_document_context() {
            Some(document) => {
                self.indexers
                    .save_document(&schema, branch, &source, &document, generation)
                    .await?;
                if let Some(target) = document.data.doc_ref() {
                    self.refresh_dependents(&schema, branch, &target, Some(&document.data))
                        .await?;
                }
                Some(document)
            }
            None => {
                if let Some(target) = change.original_document.as_ref().and_then(Resource::doc_ref) {
                    self.indexers.delete_document(branch, &target).await?;
                    self.refresh_dependents(&schema, branch, &target, None).await?;
                }
                None
            }
        };

        if let Some(next) = next {
            *self.schema.write().await = next;
            tracing::info!(branch, type_name = %kind, "schema replaced");
        }

        let realms = schema.user_realms(context);
        Ok(written.and_then(|document| schema.apply_read_authorization(&document, &realms)))
    }

    /// Rewrite the included copies of `target` held by the documents that
    /// reference it
    async fn refresh_dependents(
        &self,
        schema: &Schema,
        branch: &str,
        target: &DocRef,
        replacement: Option<&Resource>,
    ) -> Result<usize> {
        let mut refreshed = 0;
        for dependent in self.indexers.invalidations(branch, target).await? {
            let Some(mut document) = self.stored(branch, &dependent).await? else {
                continue;
            };
            let Some(position) = document
                .included
                .iter()
                .position(|r| r.doc_ref().as_ref() == Some(target))
            else {
                continue;
            };
            match replacement {
                Some(resource) => document.included[position] = resource.clone(),
                None => {
                    document.included.remove(position);
                }
            }
            let Some(content_type) = schema.content_type(&dependent.kind) else {
                continue;
            };
            let source = Self::source_id(content_type);
            let generation = self.current_generation(branch, &source).await?;
            self.indexers
                .save_document(schema, branch, &source, &document, generation)
                .await?;
            refreshed += 1;
        }
        if refreshed > 0 {
            tracing::debug!(branch, target = %target, refreshed, "refreshed dependents");
        }
        Ok(refreshed)
    }

    pub async fn create(
        &self,
        branch: &str,
        document: Resource,
        context: &RequestContext,
    ) -> Result<Option<DocumentContext>> {
        let schema = self.schema().await;
        let content_type = schema.require_type(&document.kind)?;
        let change = match content_type.data_source.as_ref().map(|s| s.writer()).transpose()?.flatten() {
            Some(writer) => {
                writer
                    .prepare_create(branch, context.session.as_ref(), document)
                    .await?
            }
            None => PendingChange::create(document),
        };
        self.write(branch, change, context).await
    }

    /// Apply `patch` over the stored document: members it carries replace
    /// the stored ones, the rest are kept
    pub async fn update(
        &self,
        branch: &str,
        patch: Resource,
        context: &RequestContext,
    ) -> Result<Option<DocumentContext>> {
        let schema = self.schema().await;
        let content_type = schema.require_type(&patch.kind)?;
        let target = patch.doc_ref().ok_or_else(|| Error::InvalidValue {
            detail: "an update needs the id of the resource".to_string(),
            pointer: "/data/id".to_string(),
        })?;
        let original = self
            .stored(branch, &target)
            .await?
            .ok_or_else(|| not_found(&target))?;
        let document = merge_patch(&original.data, patch);

        let change = match content_type.data_source.as_ref().map(|s| s.writer()).transpose()?.flatten() {
            Some(writer) => {
                writer
                    .prepare_update(branch, context.session.as_ref(), original.data, document)
                    .await?
            }
            None => PendingChange::update(original.data, document)
                .with_original_included(original.included.clone())
                .with_final_included(original.included),
        };
        self.write(branch, change, context).await
    }

    pub async fn delete(
        &self,
        branch: &str,
        target: &DocRef,
        context: &RequestContext,
    ) -> Result<()> {
        let schema = self.schema().await;
        let content_type = schema.require_type(&target.kind)?;
        let original = self
            .stored(branch, target)
            .await?
            .ok_or_else(|| not_found(target))?;
        let change = match content_type.data_source.as_ref().map(|s| s.writer()).transpose()?.flatten() {
            Some(writer) => {
                writer
                    .prepare_delete(branch, context.session.as_ref(), original.data)
                    .await?
            }
            None => PendingChange::delete(original.data).with_original_included(original.included),
        };
        self.write(branch, change, context).await?;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn search(
        &self,
        branch: &str,
        query: &hubql::Query,
        context: &RequestContext,
    ) -> Result<SearchPage> {
        let schema = self.schema().await;
        self.searcher
            .search(&self.client, &schema, branch, query, context)
            .await
    }

    /// One document as the requester may see it
    ///
    /// A data source with its own searcher is asked first. With a `format`,
    /// included resources are narrowed to that fieldset.
    pub async fn get(
        &self,
        branch: &str,
        target: &DocRef,
        format: Option<&str>,
        context: &RequestContext,
    ) -> Result<DocumentContext> {
        let schema = self.schema().await;
        let content_type = schema.require_type(&target.kind)?;

        let from_source = match content_type.data_source.as_ref().map(|s| s.searcher()).transpose()?.flatten() {
            Some(searcher) => searcher.get(branch, &target.kind, &target.id).await?,
            None => None,
        };
        let document = match from_source {
            Some(document) => document,
            None => self
                .stored(branch, target)
                .await?
                .ok_or_else(|| not_found(target))?,
        };

        let realms = schema.user_realms(context);
        let visible = schema
            .apply_read_authorization(&document, &realms)
            .ok_or_else(|| not_found(target))?;
        Ok(match format {
            Some(format) => schema.apply_fieldset(&visible, format),
            None => visible,
        })
    }

    // =========================================================================
    // Indexing and sessions
    // =========================================================================

    /// Run one indexing pass over every data source
    ///
    /// Static models are always a complete pass. Sources with an indexer
    /// are asked for what changed since their last stored progress.
    pub async fn reindex(&self, branch: &str) -> Result<u64> {
        let schema = self.schema().await;
        let mut sources: Vec<_> = schema.data_sources.values().cloned().collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));

        let mut deleted = 0;
        for source in sources {
            let models = source.static_models()?;
            if !models.is_empty() {
                let update = IndexUpdate {
                    documents: models.into_iter().map(DocumentContext::new).collect(),
                    complete: true,
                    ..Default::default()
                };
                deleted += self
                    .indexers
                    .apply_update(&schema, branch, &source.id, &update)
                    .await?;
            }
            if let Some(indexer) = source.indexer()? {
                let last = self
                    .indexers
                    .source_meta(branch, &source.id)
                    .await?
                    .and_then(|meta| meta.get("progress").cloned());
                let update = indexer.update_content(branch, last.as_ref()).await?;
                deleted += self
                    .indexers
                    .apply_update(&schema, branch, &source.id, &update)
                    .await?;
            }
        }
        Ok(deleted)
    }

    /// Exchange a login payload for a session through `source`
    pub async fn authenticate(
        &self,
        source: &str,
        payload: &serde_json::Value,
    ) -> Result<Option<Session>> {
        let schema = self.schema().await;
        let data_source = schema.data_sources.get(source).ok_or_else(|| Error::Config {
            message: format!("no data source named \"{}\"", source),
        })?;
        let Some(authenticator) = data_source.authenticator()? else {
            return Ok(None);
        };
        let user = authenticator.authenticate(payload).await?;
        tracing::debug!(source, authenticated = user.is_some(), "authentication attempt");
        Ok(user.map(Session::for_user))
    }

    /// Delete rows of `source` not stamped with `generation`
    pub async fn gc(&self, branch: &str, source: &str, generation: i64) -> Result<u64> {
        self.client
            .delete_older_generations(branch, source, generation)
            .await
    }
}

fn not_found(target: &DocRef) -> Error {
    Error::NotFound {
        type_name: target.kind.clone(),
        id: target.id.clone(),
    }
}

/// `original` with every member `patch` carries replaced
pub fn merge_patch(original: &Resource, patch: Resource) -> Resource {
    let mut merged = original.clone();
    merged.attributes.extend(patch.attributes);
    merged.relationships.extend(patch.relationships);
    if patch.meta.is_some() {
        merged.meta = patch.meta;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_patch() {
        let original = Resource::new("articles", Some("1".into()))
            .with_attribute("title", "Old")
            .with_attribute("body", "Text")
            .with_relationship("author", json!({"type": "people", "id": "p1"}));
        let patch = Resource::new("articles", Some("1".into())).with_attribute("title", "New");
        let merged = merge_patch(&original, patch);
        assert_eq!(merged.attribute("title"), Some(&json!("New")));
        assert_eq!(merged.attribute("body"), Some(&json!("Text")));
        assert_eq!(merged.related("author"), vec![DocRef::new("people", "p1")]);
        assert!(merged.meta.is_none());
    }
}
