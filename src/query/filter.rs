//! Filter compilation
//!
//! Turns a `hubql::Filter` into a WHERE-clause expression. Combinators
//! always parenthesize their operands; values are always parameters.

use super::expression::{build_query_expression, FieldExpression, FieldLookup};
use super::sql::{any, every, not, scalar_text, Expression, Param};
use crate::error::{Error, Result};
use hubql::{Filter, Predicate, Range};
use serde_json::Value;

/// Compile a filter tree
pub fn filter_condition(lookup: &dyn FieldLookup, filter: &Filter) -> Result<Expression> {
    match filter {
        Filter::And(filters) => Ok(every(
            filters
                .iter()
                .map(|f| filter_condition(lookup, f))
                .collect::<Result<Vec<_>>>()?,
        )),
        Filter::Or(filters) => Ok(any(
            filters
                .iter()
                .map(|f| filter_condition(lookup, f))
                .collect::<Result<Vec<_>>>()?,
        )),
        Filter::Not(inner) => Ok(not(filter_condition(lookup, inner)?)),
        Filter::Field { path, predicate } => {
            let target = build_query_expression(lookup, path)?;
            field_filter(&target, predicate, &path.to_string())
        }
    }
}

fn bad_filter(location: &str, message: impl Into<String>) -> Error {
    Error::InvalidQuery {
        message: message.into(),
        location: Some(location.to_string()),
    }
}

/// `to_tsvector` over the target, joining arrays first
fn text_vector(target: &FieldExpression<'_>) -> Expression {
    let source = if target.plural {
        Expression::sql("array_to_string(")
            .then(target.expression.clone())
            .then_sql(", ' ')")
    } else {
        target.expression.clone()
    };
    Expression::sql("to_tsvector('english',")
        .then(source)
        .then_sql(")")
}

/// Compile one predicate applied to a compiled path
pub fn field_filter(
    target: &FieldExpression<'_>,
    predicate: &Predicate,
    location: &str,
) -> Result<Expression> {
    match predicate {
        Predicate::Any(items) => Ok(any(
            items
                .iter()
                .map(|p| field_filter(target, p, location))
                .collect::<Result<Vec<_>>>()?,
        )),
        Predicate::Text(words) => Ok(text_vector(target)
            .then_sql("@@ plainto_tsquery('english',")
            .then_param(Param::Text(words.clone()))
            .then_sql(")")),
        Predicate::Exact(value) => exact_filter(target, value, location),
        Predicate::Range(range) => range_filter(target, range, location),
        Predicate::Exists(exists) => {
            let test = if *exists { "IS NOT NULL" } else { "IS NULL" };
            if target.plural {
                Ok(Expression::sql("array_length(")
                    .then(target.expression.clone())
                    .then_sql(format!(", 1) {}", test)))
            } else {
                Ok(target.expression.clone().then_sql(test))
            }
        }
        Predicate::Prefix(prefix) => {
            let terms: Vec<String> = prefix
                .split_whitespace()
                .map(|word| word.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
                .filter(|word| !word.is_empty())
                .map(|word| format!("{}:*", word))
                .collect();
            if terms.is_empty() {
                return Ok(Expression::sql("true"));
            }
            Ok(text_vector(target)
                .then_sql("@@ to_tsquery('english',")
                .then_param(Param::Text(terms.join(" & ")))
                .then_sql(")"))
        }
    }
}

fn exact_filter(target: &FieldExpression<'_>, value: &Value, location: &str) -> Result<Expression> {
    let values: Vec<String> = match value {
        Value::Null => {
            return Ok(if target.plural {
                Expression::sql("array_length(")
                    .then(target.expression.clone())
                    .then_sql(", 1) IS NULL")
            } else {
                target.expression.clone().then_sql("IS NULL")
            });
        }
        Value::Array(items) => items
            .iter()
            .map(|item| {
                scalar_text(item)
                    .ok_or_else(|| bad_filter(location, "exact filter values must be scalars"))
            })
            .collect::<Result<_>>()?,
        other => vec![scalar_text(other)
            .ok_or_else(|| bad_filter(location, "exact filter values must be scalars"))?],
    };

    if target.plural {
        return Ok(target
            .expression
            .clone()
            .then_sql("&&")
            .then_param(Param::TextArray(values))
            .then_sql("::text[]"));
    }
    if value.is_array() {
        return Ok(target
            .expression
            .clone()
            .then_sql("= any(")
            .then_param(Param::TextArray(values))
            .then_sql("::text[])"));
    }
    let mut values = values;
    let single = values.pop().unwrap_or_default();
    Ok(target
        .expression
        .clone()
        .then_sql("=")
        .then_param(Param::Text(single)))
}

fn range_filter(target: &FieldExpression<'_>, range: &Range, location: &str) -> Result<Expression> {
    if target.plural {
        return Err(bad_filter(
            location,
            "range filters are not implemented across a has-many relationship",
        ));
    }
    let bounds = range.bounds();
    if bounds.is_empty() {
        return Err(bad_filter(location, "range filter needs at least one of lt, lte, gt, gte"));
    }
    let cast = target.field.sql_cast();
    let mut comparisons = Vec::with_capacity(bounds.len());
    for (operator, bound) in bounds {
        let text = scalar_text(bound)
            .ok_or_else(|| bad_filter(location, "range bounds must be scalars"))?;
        if !target.field.valid_sql_literal(&text) {
            return Err(bad_filter(
                location,
                format!(
                    "range bound {} is not a valid {} value",
                    bound,
                    cast.unwrap_or("text")
                ),
            ));
        }
        let comparison = match cast {
            Some(cast) => target
                .expression
                .clone()
                .parenthesized()
                .then_sql(format!("::{} {}", cast, operator))
                .then_param(Param::Text(text))
                .then_sql(format!("::{}", cast)),
            None => target
                .expression
                .clone()
                .then_sql(operator)
                .then_param(Param::Text(text)),
        };
        comparisons.push(comparison);
    }
    Ok(every(comparisons))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expression::tests::library;
    use crate::query::sql::query_to_sql;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn compile(filter: Value) -> Result<(String, Vec<Param>)> {
        let schema = library();
        let filter = hubql::parse_filter(&filter).unwrap();
        let q = query_to_sql(&filter_condition(&schema, &filter)?);
        Ok((q.text, q.values))
    }

    #[test]
    fn test_full_text() {
        let (text, values) = compile(json!({"title": "hello world"})).unwrap();
        assert_eq!(
            text,
            "to_tsvector('english', search_doc ->> $1 ) @@ plainto_tsquery('english', $2 )"
        );
        assert_eq!(values[1], Param::Text("hello world".into()));

        let (text, _) = compile(json!({"tags": "rust"})).unwrap();
        assert!(text.contains("array_to_string("));
    }

    #[test]
    fn test_exact() {
        let (text, values) = compile(json!({"title": {"exact": "Hi"}})).unwrap();
        assert_eq!(text, "search_doc ->> $1 = $2");
        assert_eq!(values[1], Param::Text("Hi".into()));

        let (text, _) = compile(json!({"type": {"exact": ["articles", "comments"]}})).unwrap();
        assert_eq!(text, "type = any( $1 ::text[])");

        let (text, values) = compile(json!({"tags": {"exact": "rust"}})).unwrap();
        assert!(text.contains("&& $2 ::text[]"));
        assert_eq!(values[1], Param::TextArray(vec!["rust".into()]));

        let (text, _) = compile(json!({"title": {"exact": null}})).unwrap();
        assert_eq!(text, "search_doc ->> $1 IS NULL");
    }

    #[test]
    fn test_range_uses_field_cast() {
        let (text, values) = compile(json!({"views": {"range": {"gt": 3, "lte": 10}}})).unwrap();
        assert_eq!(
            text,
            "( ( ( search_doc ->> $1 ) ::numeric <= $2 ::numeric ) AND ( ( search_doc ->> $3 ) ::numeric > $4 ::numeric ) )"
        );
        assert_eq!(values[1], Param::Text("10".into()));
    }

    #[test]
    fn test_range_bound_must_fit_cast() {
        for bound in [json!("abc"), json!(true), json!("1e400")] {
            let err = compile(json!({"views": {"range": {"gt": bound}}})).unwrap_err();
            assert!(matches!(err, Error::InvalidQuery { .. }), "{}", bound);
            assert_eq!(err.status(), 400);
        }
        assert!(compile(json!({"views": {"range": {"gte": "2.5"}}})).is_ok());
        assert!(compile(json!({"title": {"range": {"gte": "abc"}}})).is_ok());
    }

    #[test]
    fn test_range_across_has_many_fails() {
        let err = compile(json!({"tags": {"range": {"gt": "3"}}})).unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(err.to_string().contains("has-many"));
        assert!(compile(json!({"comments.body": {"range": {"gt": "a"}}})).is_err());
    }

    #[test]
    fn test_exists_and_prefix() {
        let (text, _) = compile(json!({"title": {"exists": true}})).unwrap();
        assert_eq!(text, "search_doc ->> $1 IS NOT NULL");
        let (text, _) = compile(json!({"tags": {"exists": false}})).unwrap();
        assert!(text.starts_with("array_length( array(select"));
        assert!(text.ends_with(", 1) IS NULL"));

        let (text, values) = compile(json!({"title": {"prefix": "ru$t lang"}})).unwrap();
        assert!(text.contains("to_tsquery('english', $2 )"));
        assert_eq!(values[1], Param::Text("rut:* & lang:*".into()));

        let (text, values) = compile(json!({"title": {"prefix": "!!"}})).unwrap();
        assert_eq!(text, "true");
        assert!(values.is_empty());
    }

    #[test]
    fn test_combinators_parenthesize() {
        let (text, _) = compile(json!({"or": [{"title": {"exact": "a"}}, {"not": {"type": {"exact": "b"}}}]}))
            .unwrap();
        assert_eq!(
            text,
            "( ( search_doc ->> $1 = $2 ) OR ( NOT ( type = $3 ) ) )"
        );
        let (text, _) = compile(json!({"or": []})).unwrap();
        assert_eq!(text, "false");
        let (text, _) = compile(json!({"and": []})).unwrap();
        assert_eq!(text, "true");
    }

    #[test]
    fn test_array_predicate_is_or() {
        let (text, _) = compile(json!({"title": ["a", {"exact": "b"}]})).unwrap();
        assert!(text.starts_with("( ( to_tsvector"));
        assert!(text.contains(") OR ( search_doc ->> $3 = $4 )"));
    }
}
