//! hubql - Filter, sort and page language for dochub
//!
//! Search requests arrive as decoded JSON:API query parameters.
//!
//! # Syntax Overview
//!
//! ```json
//! {
//!   "filter": {
//!     "title": "full text words",
//!     "tags": {"exact": ["rust", "sql"]},
//!     "published": {"range": {"gte": "2020-01-01"}},
//!     "author.name": {"prefix": "ali"},
//!     "or": [{"draft": {"exists": false}}, {"type": "events"}],
//!     "not": {"comments.body": "spam"}
//!   },
//!   "sort": "-published,title",
//!   "page": {"size": 20, "cursor": "..."}
//! }
//! ```
//!
//! - A string value is a full-text match
//! - An array value is an OR of its items
//! - `and`/`or`/`not` nest the same shape
//! - A `-` prefix on a sort key sorts descending

mod ast;
mod error;
mod parser;

pub use ast::*;
pub use error::ParseError;
pub use parser::{parse_field_path, parse_filter, parse_page, parse_query, parse_sort, parse_sort_list};

/// Read a `{filter, sort, page}` request from JSON
pub fn parse(value: &serde_json::Value) -> Result<Query, ParseError> {
    parser::parse_query(value)
}

/// Read a request from JSON text
pub fn parse_str(input: &str) -> Result<Query, ParseError> {
    let value: serde_json::Value =
        serde_json::from_str(input).map_err(|e| ParseError::new(format!("Invalid JSON: {}", e)))?;
    parse(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_str() {
        let query = parse_str(r#"{"filter": {"type": "articles"}, "sort": "title"}"#).unwrap();
        assert!(matches!(query.filter, Some(Filter::Field { .. })));
        assert_eq!(query.sort[0].path.to_string(), "title");
    }

    #[test]
    fn test_parse_empty() {
        let query = parse_str("{}").unwrap();
        assert_eq!(query, Query::default());
    }

    #[test]
    fn test_invalid_json() {
        assert!(parse_str("{filter").is_err());
    }
}
