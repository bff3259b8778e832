//! Postgres persistence
//!
//! Two tables:
//! - `documents(branch, type, id, search_doc, pristine_doc, source,
//!   generation, refs)`, keyed by `(branch, type, id)`
//! - `meta(branch, id, params)`, keyed by `(branch, id)`
//!
//! Every statement takes a pooled connection and gives it back when done,
//! on success or error.

use super::document::DocRef;
use crate::error::Result;
use crate::query::sql::SqlQuery;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

/// Default number of referenced ids per scan query
pub const DEFAULT_ID_BATCH_SIZE: usize = 100;

/// Default number of rows fetched per cursor round trip
pub const DEFAULT_ROW_BATCH_SIZE: usize = 100;

const CREATE_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        branch text NOT NULL,
        type text NOT NULL,
        id text NOT NULL,
        search_doc jsonb,
        pristine_doc jsonb,
        source text,
        generation bigint,
        refs text[],
        CONSTRAINT documents_pkey PRIMARY KEY (branch, type, id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS documents_refs ON documents USING gin (refs)",
    "CREATE INDEX IF NOT EXISTS documents_source ON documents (branch, source)",
    r#"
    CREATE TABLE IF NOT EXISTS meta (
        branch text NOT NULL,
        id text NOT NULL,
        params jsonb,
        CONSTRAINT meta_pkey PRIMARY KEY (branch, id)
    )
    "#,
];

/// One row of the documents table
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRow {
    pub branch: String,
    pub kind: String,
    pub id: String,
    pub search_doc: Value,
    pub pristine_doc: Value,
    pub source: String,
    pub generation: Option<i64>,
    /// `type/id` of every referenced document
    pub refs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PgClient {
    pool: PgPool,
    id_batch_size: usize,
    row_batch_size: usize,
}

impl PgClient {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        tracing::debug!(max_connections, "connected to postgres");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            id_batch_size: DEFAULT_ID_BATCH_SIZE,
            row_batch_size: DEFAULT_ROW_BATCH_SIZE,
        }
    }

    /// Override the reference scan batch sizes
    pub fn with_batch_sizes(mut self, id_batch_size: usize, row_batch_size: usize) -> Self {
        self.id_batch_size = id_batch_size.max(1);
        self.row_batch_size = row_batch_size.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they are missing
    pub async fn ensure_database(&self) -> Result<()> {
        for statement in CREATE_TABLES {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert or fully overwrite a document row
    pub async fn save_document(&self, row: &DocumentRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (branch, type, id, search_doc, pristine_doc, source, generation, refs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT ON CONSTRAINT documents_pkey DO UPDATE SET
                search_doc = EXCLUDED.search_doc,
                pristine_doc = EXCLUDED.pristine_doc,
                source = EXCLUDED.source,
                generation = EXCLUDED.generation,
                refs = EXCLUDED.refs
            "#,
        )
        .bind(&row.branch)
        .bind(&row.kind)
        .bind(&row.id)
        .bind(&row.search_doc)
        .bind(&row.pristine_doc)
        .bind(&row.source)
        .bind(row.generation)
        .bind(&row.refs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove one document; true if a row was deleted
    pub async fn delete_document(&self, branch: &str, kind: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE branch = $1 AND type = $2 AND id = $3")
            .bind(branch)
            .bind(kind)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The pristine document stored for `(branch, type, id)`
    pub async fn get(&self, branch: &str, kind: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query_scalar::<_, Option<Value>>(
            "SELECT pristine_doc FROM documents WHERE branch = $1 AND type = $2 AND id = $3",
        )
        .bind(branch)
        .bind(kind)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.flatten())
    }

    /// Pristine documents of the given types, ordered by type and id
    pub async fn documents_of_types(&self, branch: &str, kinds: &[String]) -> Result<Vec<Value>> {
        let rows = sqlx::query_scalar::<_, Option<Value>>(
            r#"
            SELECT pristine_doc FROM documents
            WHERE branch = $1 AND type = any($2::text[])
            ORDER BY type, id
            "#,
        )
        .bind(branch)
        .bind(kinds)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Delete every row of `(branch, source)` not stamped with `generation`
    pub async fn delete_older_generations(
        &self,
        branch: &str,
        source: &str,
        generation: i64,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM documents
            WHERE branch = $1 AND source = $2 AND generation IS DISTINCT FROM $3
            "#,
        )
        .bind(branch)
        .bind(source)
        .bind(generation)
        .execute(&self.pool)
        .await?;
        tracing::info!(branch, source, generation, deleted = result.rows_affected(), "deleted older generations");
        Ok(result.rows_affected())
    }

    pub async fn read_meta(&self, branch: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query_scalar::<_, Option<Value>>(
            "SELECT params FROM meta WHERE branch = $1 AND id = $2",
        )
        .bind(branch)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.flatten())
    }

    pub async fn write_meta(&self, branch: &str, id: &str, params: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO meta (branch, id, params) VALUES ($1, $2, $3)
            ON CONFLICT ON CONSTRAINT meta_pkey DO UPDATE SET params = EXCLUDED.params
            "#,
        )
        .bind(branch)
        .bind(id)
        .bind(params)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stream the documents whose `refs` mention any of `refs`
    ///
    /// Referenced ids are sent in batches; matching rows are read through a
    /// server-side cursor a batch at a time and handed to `on_batch`.
    pub async fn docs_that_reference<F>(&self, branch: &str, refs: &[String], mut on_batch: F) -> Result<()>
    where
        F: FnMut(Vec<DocRef>),
    {
        let fetch = format!("FETCH {} FROM refs_cursor", self.row_batch_size);
        for ids in refs.chunks(self.id_batch_size) {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                DECLARE refs_cursor NO SCROLL CURSOR FOR
                SELECT type, id FROM documents WHERE branch = $1 AND refs && $2::text[]
                "#,
            )
            .bind(branch)
            .bind(ids)
            .execute(&mut *tx)
            .await?;

            let mut batches = 0usize;
            loop {
                let rows = sqlx::query(&fetch).fetch_all(&mut *tx).await?;
                if rows.is_empty() {
                    break;
                }
                let found = rows
                    .iter()
                    .map(|row| Ok(DocRef::new(row.try_get::<String, _>("type")?, row.try_get::<String, _>("id")?)))
                    .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;
                batches += 1;
                on_batch(found);
            }

            sqlx::query("CLOSE refs_cursor").execute(&mut *tx).await?;
            tx.commit().await?;
            tracing::debug!(branch, ids = ids.len(), batches, "scanned references");
        }
        Ok(())
    }

    /// Run a compiled query and return its rows
    pub async fn query(&self, query: &SqlQuery) -> Result<Vec<PgRow>> {
        tracing::debug!(sql = %query.text, params = query.values.len(), "running query");
        Ok(query.bind().fetch_all(&self.pool).await?)
    }
}
