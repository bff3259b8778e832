//! Indexing runs
//!
//! Each pass over a data source is stamped with a fresh generation. Rows
//! saved during the pass carry it; when a complete pass finishes, rows of
//! the same source with any other generation are stale and get deleted.

use super::document::{DocRef, DocumentContext};
use super::pg::{DocumentRow, PgClient};
use crate::error::{Error, Result};
use crate::schema::plugins::IndexUpdate;
use crate::schema::Schema;
use serde_json::{json, Value};

/// Meta row id holding a source's indexing state
fn meta_id(source: &str) -> String {
    format!("source:{}", source)
}

/// Flatten a document into its stored row
pub fn document_row(
    schema: &Schema,
    branch: &str,
    source: &str,
    document: &DocumentContext,
    generation: Option<i64>,
) -> Result<DocumentRow> {
    let data = &document.data;
    let id = data.id.clone().ok_or_else(|| Error::InvalidValue {
        detail: format!("a \"{}\" document needs an id to be indexed", data.kind),
        pointer: "/data/id".to_string(),
    })?;
    let content_type = schema.require_type(&data.kind)?;

    Ok(DocumentRow {
        branch: branch.to_string(),
        kind: data.kind.clone(),
        id,
        search_doc: content_type.search_doc(schema, data, &document.included),
        pristine_doc: serde_json::to_value(document)?,
        source: source.to_string(),
        generation,
        refs: data.all_related().iter().map(DocRef::to_string).collect(),
    })
}

/// Writes documents into the shared index
#[derive(Debug, Clone)]
pub struct Indexers {
    client: PgClient,
}

impl Indexers {
    pub fn new(client: PgClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &PgClient {
        &self.client
    }

    /// Save one document outside of a run
    pub async fn save_document(
        &self,
        schema: &Schema,
        branch: &str,
        source: &str,
        document: &DocumentContext,
        generation: Option<i64>,
    ) -> Result<()> {
        let row = document_row(schema, branch, source, document, generation)?;
        tracing::debug!(branch, source, type_name = %row.kind, id = %row.id, "indexing document");
        self.client.save_document(&row).await
    }

    pub async fn delete_document(&self, branch: &str, target: &DocRef) -> Result<bool> {
        self.client.delete_document(branch, &target.kind, &target.id).await
    }

    /// The indexing state last stored for `source`
    pub async fn source_meta(&self, branch: &str, source: &str) -> Result<Option<Value>> {
        self.client.read_meta(branch, &meta_id(source)).await
    }

    /// Start a pass over `source`, one generation past the last finished one
    pub async fn begin_run(&self, branch: &str, source: &str) -> Result<IndexRun<'_>> {
        let last = self
            .source_meta(branch, source)
            .await?
            .and_then(|meta| meta.get("generation").and_then(Value::as_i64))
            .unwrap_or(0);
        let generation = last + 1;
        tracing::info!(branch, source, generation, "starting index run");
        Ok(IndexRun {
            indexers: self,
            branch: branch.to_string(),
            source: source.to_string(),
            generation,
            saved: 0,
        })
    }

    /// Documents that point at `target` and need reindexing with it
    pub async fn invalidations(&self, branch: &str, target: &DocRef) -> Result<Vec<DocRef>> {
        let mut dependents = Vec::new();
        self.client
            .docs_that_reference(branch, &[target.to_string()], |batch| dependents.extend(batch))
            .await?;
        dependents.sort();
        dependents.dedup();
        dependents.retain(|d| d != target);
        Ok(dependents)
    }

    /// Apply what an indexer produced for `source`
    ///
    /// A complete update runs as a full pass, so rows it did not touch are
    /// collected afterwards. A partial update only saves and deletes.
    pub async fn apply_update(
        &self,
        schema: &Schema,
        branch: &str,
        source: &str,
        update: &IndexUpdate,
    ) -> Result<u64> {
        let mut run = self.begin_run(branch, source).await?;
        for document in &update.documents {
            run.save(schema, document).await?;
        }
        for target in &update.removed {
            run.delete(target).await?;
        }
        if update.complete {
            run.finish(update.meta.clone()).await
        } else {
            run.checkpoint(update.meta.clone()).await?;
            Ok(0)
        }
    }
}

/// One generation-stamped pass over a source
#[derive(Debug)]
pub struct IndexRun<'a> {
    indexers: &'a Indexers,
    branch: String,
    source: String,
    generation: i64,
    saved: usize,
}

impl IndexRun<'_> {
    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub async fn save(&mut self, schema: &Schema, document: &DocumentContext) -> Result<()> {
        self.indexers
            .save_document(schema, &self.branch, &self.source, document, Some(self.generation))
            .await?;
        self.saved += 1;
        Ok(())
    }

    pub async fn delete(&mut self, target: &DocRef) -> Result<bool> {
        self.indexers.delete_document(&self.branch, target).await
    }

    /// Record progress without collecting stale rows
    async fn checkpoint(&self, progress: Value) -> Result<()> {
        let meta = json!({ "generation": self.generation - 1, "progress": progress });
        self.indexers
            .client
            .write_meta(&self.branch, &meta_id(&self.source), &meta)
            .await
    }

    /// Delete rows of older generations and store this one as finished
    pub async fn finish(self, progress: Value) -> Result<u64> {
        let deleted = self
            .indexers
            .client
            .delete_older_generations(&self.branch, &self.source, self.generation)
            .await?;
        let meta = json!({ "generation": self.generation, "progress": progress });
        self.indexers
            .client
            .write_meta(&self.branch, &meta_id(&self.source), &meta)
            .await?;
        tracing::info!(
            branch = %self.branch,
            source = %self.source,
            generation = self.generation,
            saved = self.saved,
            deleted,
            "finished index run"
        );
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::models_from_value;
    use crate::schema::PluginRegistry;
    use crate::storage::document::Resource;
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> Schema {
        let models = models_from_value(json!([
            {"type": "content-types", "id": "articles", "relationships": {"fields": {"data": [
                {"type": "fields", "id": "title"},
                {"type": "fields", "id": "author"}
            ]}}},
            {"type": "content-types", "id": "people"},
            {"type": "fields", "id": "title", "attributes": {"field-type": "string"}},
            {"type": "fields", "id": "author", "attributes": {"field-type": "belongs-to"}}
        ]))
        .unwrap();
        Schema::load(models, Arc::new(PluginRegistry::with_builtins())).unwrap()
    }

    #[test]
    fn test_document_row() {
        let schema = schema();
        let doc = DocumentContext::new(
            Resource::new("articles", Some("1".into()))
                .with_attribute("title", "Hello")
                .with_relationship("author", json!({"type": "people", "id": "p1"})),
        );
        let row = document_row(&schema, "master", "default", &doc, Some(4)).unwrap();
        assert_eq!(row.kind, "articles");
        assert_eq!(row.refs, vec!["people/p1".to_string()]);
        assert_eq!(row.search_doc["title"], json!("Hello"));
        assert_eq!(row.search_doc["author"], json!({"type": "people", "id": "p1"}));
        assert_eq!(row.pristine_doc["data"]["attributes"]["title"], json!("Hello"));
        assert_eq!(row.generation, Some(4));
    }

    #[test]
    fn test_document_row_needs_id_and_type() {
        let schema = schema();
        let no_id = DocumentContext::new(Resource::new("articles", None));
        assert_eq!(document_row(&schema, "master", "s", &no_id, None).unwrap_err().status(), 400);
        let unknown = DocumentContext::new(Resource::new("events", Some("1".into())));
        assert!(matches!(
            document_row(&schema, "master", "s", &unknown, None),
            Err(Error::UnknownType { .. })
        ));
    }
}
