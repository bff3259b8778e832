//! Sorts and keyset pagination
//!
//! Every sort list ends with the primary key `(branch, type, id)` so that
//! row order is total. A page cursor holds the last row's sort-key values;
//! the next page continues strictly after that tuple.

use super::expression::{build_query_expression, FieldLookup};
use super::sql::{any, every, scalar_text, Expression, Param};
use crate::error::{Error, Result};
use crate::schema::plugins::literal_fits_cast;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hubql::{Sort, SortDirection};
use serde_json::Value;

/// Primary key columns of the documents table
pub const PRIMARY_KEY: &[&str] = &["branch", "type", "id"];

/// One compiled sort key
#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    /// Path or column name, for matching against the primary key
    pub name: String,
    pub expression: Expression,
    pub direction: SortDirection,
    /// Postgres type the key is compared as
    pub cast: Option<&'static str>,
}

impl SortKey {
    fn column(name: &str) -> Self {
        Self {
            name: name.to_string(),
            expression: Expression::sql(name),
            direction: SortDirection::Asc,
            cast: None,
        }
    }

    /// A parameter holding `value`, cast like the key
    fn bound(&self, value: &Value) -> Result<Expression> {
        let text = scalar_text(value).ok_or_else(|| Error::InvalidCursor {
            reason: format!("sort value {} is not a scalar", value),
        })?;
        if let Some(cast) = self.cast {
            if !literal_fits_cast(cast, &text) {
                return Err(Error::InvalidCursor {
                    reason: format!("sort value {} is not a valid {} value", value, cast),
                });
            }
        }
        let mut expression = Expression::param(Param::Text(text));
        if let Some(cast) = self.cast {
            expression.push_sql(format!("::{}", cast));
        }
        Ok(expression)
    }

    fn equals(&self, value: &Value) -> Result<Expression> {
        if value.is_null() {
            return Ok(self.expression.clone().then_sql("IS NULL"));
        }
        Ok(self
            .expression
            .clone()
            .then_sql("IS NOT DISTINCT FROM")
            .then(self.bound(value)?))
    }

    /// Rows strictly after `value` in this key's order
    ///
    /// Ascending puts nulls last, descending puts them first.
    fn after(&self, value: &Value) -> Result<Expression> {
        match (self.direction, value.is_null()) {
            (SortDirection::Asc, true) => Ok(Expression::sql("false")),
            (SortDirection::Asc, false) => Ok(any(vec![
                self.expression.clone().then_sql(">").then(self.bound(value)?),
                self.expression.clone().then_sql("IS NULL"),
            ])),
            (SortDirection::Desc, true) => Ok(self.expression.clone().then_sql("IS NOT NULL")),
            (SortDirection::Desc, false) => {
                Ok(self.expression.clone().then_sql("<").then(self.bound(value)?))
            }
        }
    }
}

/// Compile sorts and append the primary key columns not already sorted on
pub fn build_sorts(lookup: &dyn FieldLookup, sorts: &[Sort]) -> Result<Vec<SortKey>> {
    let mut keys = Vec::with_capacity(sorts.len() + PRIMARY_KEY.len());
    for sort in sorts {
        let target = build_query_expression(lookup, &sort.path)?;
        if target.plural {
            return Err(Error::InvalidQuery {
                message: format!("Cannot sort by plural field \"{}\"", sort.path),
                location: Some(sort.path.to_string()),
            });
        }
        let cast = target.field.sql_cast();
        let expression = match cast {
            Some(cast) => target
                .expression
                .parenthesized()
                .then_sql(format!("::{}", cast)),
            None => target.expression,
        };
        keys.push(SortKey {
            name: sort.path.to_string(),
            expression,
            direction: sort.direction,
            cast,
        });
    }
    for column in PRIMARY_KEY {
        if !keys.iter().any(|k| k.name == *column) {
            keys.push(SortKey::column(column));
        }
    }
    Ok(keys)
}

/// `ORDER BY k1 asc, k2 desc, ...`
pub fn order_by(keys: &[SortKey]) -> Expression {
    let mut out = Expression::sql("ORDER BY");
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push_sql(",");
        }
        out.append(key.expression.clone());
        out.push_sql(key.direction.as_sql());
    }
    out
}

/// `jsonb_build_array(k1, k2, ...)`, the values a cursor is made of
pub fn sort_values(keys: &[SortKey]) -> Expression {
    let mut out = Expression::sql("jsonb_build_array(");
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push_sql(",");
        }
        out.append(key.expression.clone());
    }
    out.push_sql(")");
    out
}

/// Rows after the tuple `values`, lexicographically over `keys`
pub fn after_expression(keys: &[SortKey], values: &[Value]) -> Result<Expression> {
    if keys.len() != values.len() {
        return Err(Error::InvalidCursor {
            reason: format!("expected {} sort values, found {}", keys.len(), values.len()),
        });
    }
    let mut branches = Vec::with_capacity(keys.len());
    for i in 0..keys.len() {
        let mut terms = Vec::with_capacity(i + 1);
        for j in 0..i {
            terms.push(keys[j].equals(&values[j])?);
        }
        terms.push(keys[i].after(&values[i])?);
        branches.push(every(terms));
    }
    Ok(any(branches))
}

pub fn encode_cursor(values: &[Value]) -> String {
    URL_SAFE_NO_PAD.encode(Value::Array(values.to_vec()).to_string())
}

/// Decode a cursor holding exactly `arity` values
pub fn decode_cursor(cursor: &str, arity: usize) -> Result<Vec<Value>> {
    let invalid = |reason: String| Error::InvalidCursor { reason };
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| invalid(e.to_string()))?;
    let values: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| invalid(e.to_string()))?;
    if values.len() != arity {
        return Err(invalid(format!(
            "expected {} sort values, found {}",
            arity,
            values.len()
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expression::tests::library;
    use crate::query::sql::query_to_sql;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn keys(sort: &str) -> Result<Vec<SortKey>> {
        let schema = library();
        build_sorts(&schema, &hubql::parse_sort_list(sort).unwrap())
    }

    #[test]
    fn test_primary_key_appended() {
        let keys = keys("-views,id").unwrap();
        let names: Vec<&str> = keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["views", "id", "branch", "type"]);
        assert_eq!(keys[0].cast, Some("numeric"));
        assert_eq!(
            query_to_sql(&order_by(&keys)).text,
            "ORDER BY ( search_doc ->> $1 ) ::numeric desc , id asc , branch asc , type asc"
        );
    }

    #[test]
    fn test_plural_sort_fails() {
        assert_eq!(keys("tags").unwrap_err().status(), 400);
        assert!(keys("comments.body").is_err());
    }

    #[test]
    fn test_cursor_roundtrip_and_arity() {
        let values = vec![json!(3), json!("master"), json!("articles"), json!("1")];
        let cursor = encode_cursor(&values);
        assert_eq!(decode_cursor(&cursor, 4).unwrap(), values);
        assert!(matches!(
            decode_cursor(&cursor, 3),
            Err(Error::InvalidCursor { .. })
        ));
        assert!(decode_cursor("not base64!", 3).is_err());
    }

    #[test]
    fn test_after_expression() {
        let keys = keys("title").unwrap();
        let values = vec![json!("b"), json!("master"), json!("articles"), json!("1")];
        let q = query_to_sql(&after_expression(&keys, &values).unwrap());
        assert!(q.text.contains("( search_doc ->> $1 > $2 ) OR ( search_doc ->> $3 IS NULL )"));
        assert!(q.text.contains("search_doc ->> $4 IS NOT DISTINCT FROM $5"));
        assert_eq!(q.values.iter().filter(|v| **v == Param::Text("b".into())).count(), 4);

        let nulls = vec![Value::Null, json!("master"), json!("articles"), json!("1")];
        let q = query_to_sql(&after_expression(&keys, &nulls).unwrap());
        assert!(q.text.starts_with("( ( ( ( false ) ) )"));
        assert!(q.text.contains("search_doc ->> $1 IS NULL"));
    }

    #[test]
    fn test_forged_cursor_value_rejected() {
        let keys = keys("views").unwrap();
        let forged = vec![json!("abc"), json!("master"), json!("articles"), json!("1")];
        assert!(matches!(
            after_expression(&keys, &forged),
            Err(Error::InvalidCursor { .. })
        ));
        let fine = vec![json!(7), json!("master"), json!("articles"), json!("1")];
        assert!(after_expression(&keys, &fine).is_ok());
    }

    #[test]
    fn test_descending_continuation() {
        let keys = keys("-title").unwrap();
        let values = vec![Value::Null, json!("master"), json!("articles"), json!("1")];
        let q = query_to_sql(&after_expression(&keys, &values).unwrap());
        assert!(q.text.contains("( search_doc ->> $1 IS NOT NULL )"));
        assert!(after_expression(&keys, &values[..2]).is_err());
    }
}
