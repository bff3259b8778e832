//! hubql readers
//!
//! Field paths and sort lists are parsed with nom; filters arrive as JSON
//! (decoded request parameters) and are read structurally.

use nom::{
    IResult,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
    combinator::{map, opt, recognize, verify},
    multi::separated_list1,
    sequence::{delimited, pair},
};
use serde_json::{Map, Value};

use crate::ast::*;
use crate::error::ParseError;

// ============================================================================
// Paths and sorts
// ============================================================================

/// Parse a dotted field path such as `comments.author.name`
pub fn parse_field_path(input: &str) -> Result<FieldPath, ParseError> {
    let (remaining, path) = field_path(input.trim())?;
    if !remaining.is_empty() {
        return Err(ParseError::new(format!("Invalid field path: {:?}", input))
            .with_position(input.len() - remaining.len()));
    }
    Ok(path)
}

/// Parse a sort list such as `-created,title`
pub fn parse_sort_list(input: &str) -> Result<Vec<Sort>, ParseError> {
    let (remaining, sorts) = sort_list(input.trim())?;
    if !remaining.is_empty() {
        return Err(ParseError::new(format!("Invalid sort: {:?}", input))
            .with_position(input.len() - remaining.len()));
    }
    Ok(sorts)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
        |s: &str| {
            let first = s.chars().next();
            let last = s.chars().last();
            first.map(|c| c.is_ascii_alphanumeric()).unwrap_or(false)
                && last.map(|c| c.is_ascii_alphanumeric()).unwrap_or(false)
        },
    )(input)
}

/// One path segment; namespaced fields join identifiers with `::`
fn segment(input: &str) -> IResult<&str, &str> {
    recognize(separated_list1(tag("::"), identifier))(input)
}

fn field_path(input: &str) -> IResult<&str, FieldPath> {
    map(separated_list1(char('.'), segment), |segments: Vec<&str>| {
        FieldPath::new(segments.into_iter().map(String::from).collect())
    })(input)
}

fn sort_item(input: &str) -> IResult<&str, Sort> {
    map(pair(opt(char('-')), field_path), |(desc, path)| Sort {
        path,
        direction: if desc.is_some() {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        },
    })(input)
}

fn sort_list(input: &str) -> IResult<&str, Vec<Sort>> {
    separated_list1(delimited(multispace0, char(','), multispace0), sort_item)(input)
}

// ============================================================================
// Query
// ============================================================================

/// Read a full `{filter, sort, page}` request
pub fn parse_query(value: &Value) -> Result<Query, ParseError> {
    let obj = match value {
        Value::Null => return Ok(Query::default()),
        Value::Object(obj) => obj,
        _ => return Err(ParseError::new("Query must be an object")),
    };

    let mut query = Query::default();
    for (key, v) in obj {
        match key.as_str() {
            "filter" => {
                if !v.is_null() {
                    query.filter = Some(parse_filter(v)?);
                }
            }
            "sort" => query.sort = parse_sort(v)?,
            "page" => query.page = parse_page(v)?,
            other => {
                return Err(ParseError::new(format!("Unknown query parameter {:?}", other)));
            }
        }
    }
    Ok(query)
}

/// Read a sort given as a string or an array of strings
pub fn parse_sort(value: &Value) -> Result<Vec<Sort>, ParseError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => parse_sort_list(s).map_err(|e| e.at("sort")),
        Value::Array(items) => {
            let mut sorts = Vec::with_capacity(items.len());
            for item in items {
                let s = item
                    .as_str()
                    .ok_or_else(|| ParseError::new("Sort entries must be strings").at("sort"))?;
                sorts.extend(parse_sort_list(s).map_err(|e| e.at("sort"))?);
            }
            Ok(sorts)
        }
        _ => Err(ParseError::new("Sort must be a string or array of strings").at("sort")),
    }
}

/// Read `{size, cursor}`
pub fn parse_page(value: &Value) -> Result<Page, ParseError> {
    let obj = match value {
        Value::Null => return Ok(Page::default()),
        Value::Object(obj) => obj,
        _ => return Err(ParseError::new("Page must be an object").at("page")),
    };

    let mut page = Page::default();
    for (key, v) in obj {
        match key.as_str() {
            "size" => {
                let size = match v {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse::<u64>().ok(),
                    _ => None,
                }
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    ParseError::new("Page size must be a positive integer").at("page.size")
                })?;
                page.size = Some(size as usize);
            }
            "cursor" => {
                page.cursor = match v {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    _ => {
                        return Err(ParseError::new("Page cursor must be a string").at("page.cursor"))
                    }
                };
            }
            other => {
                return Err(ParseError::new(format!("Unknown page parameter {:?}", other)).at("page"))
            }
        }
    }
    Ok(page)
}

// ============================================================================
// Filters
// ============================================================================

/// Read a filter object
pub fn parse_filter(value: &Value) -> Result<Filter, ParseError> {
    filter_at(value, "filter")
}

fn filter_at(value: &Value, location: &str) -> Result<Filter, ParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ParseError::new("Filter must be an object").at(location))?;
    let mut terms = filter_entries(obj, location)?;
    if terms.len() == 1 {
        Ok(terms.remove(0))
    } else {
        Ok(Filter::And(terms))
    }
}

fn filter_entries(obj: &Map<String, Value>, location: &str) -> Result<Vec<Filter>, ParseError> {
    let mut terms = Vec::with_capacity(obj.len());
    for (key, v) in obj {
        let here = format!("{}.{}", location, key);
        let term = match key.as_str() {
            "and" => Filter::And(combinator_items(v, &here)?),
            "or" => Filter::Or(combinator_items(v, &here)?),
            "not" => Filter::Not(Box::new(filter_at(v, &here)?)),
            _ => {
                let path = parse_field_path(key).map_err(|e| e.at(here.clone()))?;
                Filter::Field {
                    path,
                    predicate: parse_predicate(v, &here)?,
                }
            }
        };
        terms.push(term);
    }
    Ok(terms)
}

/// `and`/`or` take an array of filters, or an object whose entries are the
/// individual terms
fn combinator_items(value: &Value, location: &str) -> Result<Vec<Filter>, ParseError> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| filter_at(item, &format!("{}[{}]", location, i)))
            .collect(),
        Value::Object(obj) => filter_entries(obj, location),
        _ => Err(ParseError::new("Expected an array or object of filters").at(location)),
    }
}

fn parse_predicate(value: &Value, location: &str) -> Result<Predicate, ParseError> {
    match value {
        Value::String(s) => Ok(Predicate::Text(s.clone())),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_predicate(item, &format!("{}[{}]", location, i)))
            .collect::<Result<Vec<_>, _>>()
            .map(Predicate::Any),
        Value::Object(obj) => {
            let mut entries = obj.iter();
            let (op, arg) = match (entries.next(), entries.next()) {
                (Some(entry), None) => entry,
                _ => {
                    return Err(ParseError::new(
                        "A field filter must have exactly one of exact, range, exists or prefix",
                    )
                    .at(location))
                }
            };
            let here = format!("{}.{}", location, op);
            match op.as_str() {
                "exact" => Ok(Predicate::Exact(arg.clone())),
                "range" => parse_range(arg, &here).map(Predicate::Range),
                "exists" => parse_bool(arg)
                    .map(Predicate::Exists)
                    .ok_or_else(|| ParseError::new("exists must be true or false").at(here)),
                "prefix" => arg
                    .as_str()
                    .map(|s| Predicate::Prefix(s.to_string()))
                    .ok_or_else(|| ParseError::new("prefix must be a string").at(here)),
                other => Err(ParseError::new(format!("Unknown filter operator {:?}", other))
                    .at(location)),
            }
        }
        _ => Err(ParseError::new("Unsupported filter value").at(location)),
    }
}

fn parse_range(value: &Value, location: &str) -> Result<Range, ParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ParseError::new("range must be an object").at(location))?;
    let mut range = Range::default();
    for (op, bound) in obj {
        if !(bound.is_string() || bound.is_number() || bound.is_boolean()) {
            return Err(ParseError::new("Range bounds must be scalar values")
                .at(format!("{}.{}", location, op)));
        }
        let slot = match op.as_str() {
            "lt" => &mut range.lt,
            "lte" => &mut range.lte,
            "gt" => &mut range.gt,
            "gte" => &mut range.gte,
            other => {
                return Err(ParseError::new(format!("Unknown range operator {:?}", other))
                    .at(location))
            }
        };
        *slot = Some(bound.clone());
    }
    Ok(range)
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s == "true" => Some(true),
        Value::String(s) if s == "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_paths() {
        let path = parse_field_path("comments.author.name").unwrap();
        assert_eq!(path.segments, vec!["comments", "author", "name"]);
        assert!(parse_field_path("title").unwrap().is_simple());
        assert!(parse_field_path("-title").is_err());
        assert!(parse_field_path("title_").is_err());
        assert!(parse_field_path("a..b").is_err());
        assert!(parse_field_path("a b").is_err());
    }

    #[test]
    fn test_namespaced_segments() {
        let path = parse_field_path("local::blog::title").unwrap();
        assert_eq!(path.segments, vec!["local::blog::title"]);
        let path = parse_field_path("comments.local::blog::author").unwrap();
        assert_eq!(path.segments, vec!["comments", "local::blog::author"]);
        assert!(parse_field_path("local::").is_err());
        assert!(parse_field_path("::title").is_err());
        assert!(parse_field_path("local:title").is_err());

        let sorts = parse_sort_list("-local::blog::title,id").unwrap();
        assert_eq!(sorts[0].direction, SortDirection::Desc);
        assert_eq!(sorts[0].path.head(), "local::blog::title");
    }

    #[test]
    fn test_sort_list() {
        let sorts = parse_sort_list("-created, title").unwrap();
        assert_eq!(sorts.len(), 2);
        assert_eq!(sorts[0].direction, SortDirection::Desc);
        assert_eq!(sorts[0].path.head(), "created");
        assert_eq!(sorts[1].direction, SortDirection::Asc);
        assert!(parse_sort_list("--x").is_err());
    }

    #[test]
    fn test_filter_shapes() {
        let filter = parse_filter(&json!({
            "title": "hello",
            "tags": {"exact": ["a", "b"]},
        }))
        .unwrap();
        match filter {
            Filter::And(terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected And, got {:?}", other),
        }

        let filter = parse_filter(&json!({"count": {"range": {"gt": 3, "lte": "9"}}})).unwrap();
        match filter {
            Filter::Field { predicate: Predicate::Range(range), .. } => {
                assert_eq!(range.bounds().len(), 2);
            }
            other => panic!("expected range, got {:?}", other),
        }
    }

    #[test]
    fn test_combinators() {
        let filter = parse_filter(&json!({
            "or": [{"title": "a"}, {"not": {"body": {"exists": "false"}}}]
        }))
        .unwrap();
        match filter {
            Filter::Or(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(items[1], Filter::Not(_)));
            }
            other => panic!("expected Or, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_filters() {
        assert!(parse_filter(&json!({"title": {"range": {"between": 1}}})).is_err());
        assert!(parse_filter(&json!({"title": {"exact": 1, "prefix": "a"}})).is_err());
        assert!(parse_filter(&json!({"title": 5})).is_err());
        assert!(parse_filter(&json!(["title"])).is_err());
        let err = parse_filter(&json!({"title": {"nope": 1}})).unwrap_err();
        assert_eq!(err.location.as_deref(), Some("filter.title"));
    }

    #[test]
    fn test_query_and_page() {
        let query = parse_query(&json!({
            "filter": {"title": "x"},
            "sort": ["-created", "title"],
            "page": {"size": "5", "cursor": "abc"}
        }))
        .unwrap();
        assert!(query.filter.is_some());
        assert_eq!(query.sort.len(), 2);
        assert_eq!(query.page.size, Some(5));
        assert_eq!(query.page.cursor.as_deref(), Some("abc"));

        assert!(parse_query(&json!({"page": {"size": 0}})).is_err());
        assert!(parse_query(&json!({"bogus": 1})).is_err());
    }
}
