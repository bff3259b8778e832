//! Search over the documents table
//!
//! A search request compiles to one statement:
//!
//! ```text
//! SELECT pristine_doc, jsonb_build_array(<sort keys>) AS sort_values
//! FROM documents
//! WHERE branch = $1 AND type = any($2::text[]) [AND filter] [AND after cursor]
//! ORDER BY <sort keys> LIMIT <size + 1>
//! ```
//!
//! Only types the requester may read are searched. The extra row tells
//! whether another page exists; its cursor holds the last returned row's
//! sort values.

use super::filter::filter_condition;
use super::sort::{after_expression, build_sorts, decode_cursor, encode_cursor, order_by, sort_values};
use super::sql::{every, query_to_sql, Expression, Param, SqlQuery};
use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::session::{RequestContext, UserRealms};
use crate::storage::document::{DocumentContext, Resource};
use crate::storage::pg::PgClient;
use hubql::{Page, Query};
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use std::collections::HashSet;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 1000;

/// One page of search results, in JSON:API shape
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchPage {
    pub data: Vec<Resource>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<Resource>,
    pub meta: SearchMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchMeta {
    pub page: PageMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PageMeta {
    /// Present when more rows follow this page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// A compiled search statement
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSearch {
    pub sql: SqlQuery,
    /// Rows to return; one more is fetched
    pub size: usize,
    /// Types the statement is restricted to
    pub types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Searcher {
    default_page_size: usize,
    max_page_size: usize,
}

impl Default for Searcher {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

impl Searcher {
    pub fn new(default_page_size: usize, max_page_size: usize) -> Self {
        let max_page_size = max_page_size.max(1);
        Self {
            default_page_size: default_page_size.clamp(1, max_page_size),
            max_page_size,
        }
    }

    /// Requested size, defaulted and capped
    pub fn page_size(&self, page: &Page) -> Result<usize> {
        match page.size {
            None => Ok(self.default_page_size),
            Some(0) => Err(Error::InvalidQuery {
                message: "page size must be at least 1".to_string(),
                location: Some("page.size".to_string()),
            }),
            Some(size) => Ok(size.min(self.max_page_size)),
        }
    }

    /// Compile `query` for a requester holding `user_realms`
    pub fn compile(
        &self,
        schema: &Schema,
        branch: &str,
        query: &Query,
        user_realms: &UserRealms,
    ) -> Result<CompiledSearch> {
        let size = self.page_size(&query.page)?;
        let types = schema.readable_types(user_realms);
        let keys = build_sorts(schema, &query.sort)?;

        let mut conditions = vec![
            Expression::sql("branch =").then_param(Param::Text(branch.to_string())),
            Expression::sql("type = any(")
                .then_param(Param::TextArray(types.clone()))
                .then_sql("::text[])"),
        ];
        if let Some(filter) = &query.filter {
            conditions.push(filter_condition(schema, filter)?);
        }
        if let Some(cursor) = &query.page.cursor {
            let values = decode_cursor(cursor, keys.len())?;
            conditions.push(after_expression(&keys, &values)?);
        }

        let statement = Expression::sql("SELECT pristine_doc ,")
            .then(sort_values(&keys))
            .then_sql("AS sort_values FROM documents WHERE")
            .then(every(conditions))
            .then(order_by(&keys))
            .then_sql("LIMIT")
            .then_param(Param::BigInt((size + 1) as i64));

        let sql = query_to_sql(&statement);
        tracing::debug!(sql = %sql.text, params = sql.values.len(), "compiled search");
        Ok(CompiledSearch { sql, size, types })
    }

    /// Run a search and assemble the page the requester may see
    pub async fn search(
        &self,
        client: &PgClient,
        schema: &Schema,
        branch: &str,
        query: &Query,
        context: &RequestContext,
    ) -> Result<SearchPage> {
        let realms = schema.user_realms(context);
        let compiled = self.compile(schema, branch, query, &realms)?;
        if compiled.types.is_empty() {
            return Ok(SearchPage::default());
        }

        let rows = client.query(&compiled.sql).await?;
        let mut documents = Vec::with_capacity(rows.len());
        let mut last_values = Vec::new();
        for row in rows.iter().take(compiled.size) {
            let pristine: Value = row.try_get("pristine_doc")?;
            documents.push(serde_json::from_value::<DocumentContext>(pristine)?);
            last_values = match row.try_get::<Value, _>("sort_values")? {
                Value::Array(values) => values,
                other => vec![other],
            };
        }
        let cursor = (rows.len() > compiled.size).then(|| encode_cursor(&last_values));

        tracing::debug!(branch, rows = documents.len(), more = cursor.is_some(), "search page");
        Ok(assemble_page(schema, &documents, &realms, cursor))
    }
}

/// Read-authorize each document and merge their included resources
pub fn assemble_page(
    schema: &Schema,
    documents: &[DocumentContext],
    user_realms: &UserRealms,
    cursor: Option<String>,
) -> SearchPage {
    let mut page = SearchPage::default();
    let mut seen = HashSet::new();
    for document in documents {
        let Some(visible) = schema.apply_read_authorization(document, user_realms) else {
            continue;
        };
        if let Some(key) = visible.data.doc_ref() {
            seen.insert(key);
        }
        page.data.push(visible.data);
        for resource in visible.included {
            let fresh = resource.doc_ref().map(|key| seen.insert(key)).unwrap_or(true);
            if fresh {
                page.included.push(resource);
            }
        }
    }
    page.included.retain(|r| {
        r.doc_ref()
            .map(|key| !page.data.iter().any(|d| d.doc_ref().as_ref() == Some(&key)))
            .unwrap_or(true)
    });
    page.meta.page.cursor = cursor;
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expression::tests::library;
    use crate::session::EVERYONE;
    use serde_json::json;

    fn everyone() -> UserRealms {
        [EVERYONE.to_string()].into_iter().collect()
    }

    fn parse(query: Value) -> Query {
        hubql::parse(&query).unwrap()
    }

    #[test]
    fn test_compile_statement_shape() {
        let schema = library();
        let searcher = Searcher::default();
        let compiled = searcher
            .compile(&schema, "master", &parse(json!({"filter": {"title": {"exact": "Hi"}}})), &everyone())
            .unwrap();
        let text = &compiled.sql.text;
        assert!(text.starts_with("SELECT pristine_doc , jsonb_build_array( branch , type , id ) AS sort_values"));
        assert!(text.contains("( branch = $1 )"));
        assert!(text.contains("( type = any( $2 ::text[]) )"));
        assert!(text.contains("( search_doc ->> $3 = $4 )"));
        assert!(text.ends_with("ORDER BY branch asc , type asc , id asc LIMIT $5"));
        assert_eq!(compiled.sql.values[4], Param::BigInt(11));
        assert_eq!(compiled.types, vec!["articles".to_string(), "comments".to_string()]);
    }

    #[test]
    fn test_page_size_defaults_and_cap() {
        let searcher = Searcher::new(10, 50);
        assert_eq!(searcher.page_size(&Page::default()).unwrap(), 10);
        let big = Page { size: Some(500), cursor: None };
        assert_eq!(searcher.page_size(&big).unwrap(), 50);
        let zero = Page { size: Some(0), cursor: None };
        assert_eq!(searcher.page_size(&zero).unwrap_err().status(), 400);
    }

    #[test]
    fn test_cursor_continues_after_last_row() {
        let schema = library();
        let searcher = Searcher::default();
        let cursor = encode_cursor(&[json!("master"), json!("articles"), json!("7")]);
        let query = parse(json!({"page": {"size": 2, "cursor": cursor}}));
        let compiled = searcher.compile(&schema, "master", &query, &everyone()).unwrap();
        assert!(compiled.sql.text.contains("IS NOT DISTINCT FROM"));
        assert!(compiled.sql.values.contains(&Param::Text("7".into())));

        let short = encode_cursor(&[json!("master")]);
        let query = parse(json!({"page": {"cursor": short}}));
        assert!(matches!(
            searcher.compile(&schema, "master", &query, &everyone()),
            Err(Error::InvalidCursor { .. })
        ));
    }

    #[test]
    fn test_unreadable_types_are_excluded() {
        let schema = library();
        let compiled = Searcher::default()
            .compile(&schema, "master", &Query::default(), &UserRealms::new())
            .unwrap();
        assert!(compiled.types.is_empty());
    }

    #[test]
    fn test_assemble_page_dedups_included() {
        let schema = library();
        let author = Resource::new("comments", Some("c1".into())).with_attribute("body", "x");
        let docs = vec![
            DocumentContext::new(Resource::new("articles", Some("1".into()))).with_included(vec![author.clone()]),
            DocumentContext::new(Resource::new("articles", Some("2".into()))).with_included(vec![author]),
        ];
        let page = assemble_page(&schema, &docs, &everyone(), Some("abc".into()));
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.included.len(), 1);
        let rendered = serde_json::to_value(&page).unwrap();
        assert_eq!(rendered["meta"]["page"]["cursor"], json!("abc"));

        let hidden = assemble_page(&schema, &docs, &UserRealms::new(), None);
        assert!(hidden.data.is_empty());
        assert!(serde_json::to_value(&hidden).unwrap()["meta"]["page"].get("cursor").is_none());
    }
}
