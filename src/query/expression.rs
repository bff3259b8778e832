//! Field path compilation
//!
//! A dotted path such as `author.name` or `comments.author.id` becomes an
//! SQL expression over `search_doc`. Field names are bound as parameters.
//! Each has-many step (and a plural leaf) adds a `jsonb_array_elements`
//! source; a path with any such source compiles to one
//! `array(select ... from ...)` so nested has-many steps never double wrap.

use super::sql::{Expression, Param};
use crate::error::{Error, Result};
use crate::schema::{ContentType, Field, Schema};
use hubql::FieldPath;

/// Resolves field names while compiling paths
pub trait FieldLookup {
    fn lookup_field(&self, name: &str) -> Option<&Field>;
}

impl FieldLookup for Schema {
    fn lookup_field(&self, name: &str) -> Option<&Field> {
        self.real_or_computed_field(name)
    }
}

impl FieldLookup for ContentType {
    fn lookup_field(&self, name: &str) -> Option<&Field> {
        self.real_or_computed_field(name)
    }
}

/// Columns of the documents table that paths may name directly
pub const COLUMN_FIELDS: &[&str] = &["type", "id"];

/// A compiled path
#[derive(Debug, Clone)]
pub struct FieldExpression<'a> {
    pub expression: Expression,
    /// The field at the end of the path
    pub field: &'a Field,
    /// True when the expression yields a text array
    pub plural: bool,
}

fn field_name(field: &Field) -> Expression {
    Expression::param(Param::Text(field.id.clone()))
}

/// Compile `path` against `lookup`
pub fn build_query_expression<'a>(
    lookup: &'a dyn FieldLookup,
    path: &FieldPath,
) -> Result<FieldExpression<'a>> {
    let resolve = |segment: &str| {
        lookup.lookup_field(segment).ok_or_else(|| Error::InvalidQuery {
            message: format!("Cannot filter or sort by unknown field \"{}\"", segment),
            location: Some(path.to_string()),
        })
    };

    if path.is_simple() && COLUMN_FIELDS.contains(&path.head()) {
        return Ok(FieldExpression {
            expression: Expression::sql(path.head()),
            field: resolve(path.head())?,
            plural: false,
        });
    }

    let mut base = Expression::sql("search_doc");
    let mut sources: Vec<Expression> = Vec::new();
    let last = path.segments.len().saturating_sub(1);

    for (i, segment) in path.segments.iter().enumerate() {
        let field = resolve(segment)?;

        if i < last {
            if !field.is_relationship {
                return Err(Error::InvalidQuery {
                    message: format!("\"{}\" is not a relationship", segment),
                    location: Some(path.to_string()),
                });
            }
            let step = base.then_sql("->").then(field_name(field));
            base = if field.is_plural {
                let alias = format!("e{}", sources.len());
                sources.push(
                    Expression::sql("jsonb_array_elements(")
                        .then(step)
                        .then_sql(format!(") as {}", alias)),
                );
                Expression::sql(alias)
            } else {
                step
            };
            continue;
        }

        let value = if field.is_plural {
            let alias = format!("e{}", sources.len());
            sources.push(
                Expression::sql("jsonb_array_elements(")
                    .then(base.clone().then_sql("->").then(field_name(field)))
                    .then_sql(format!(") as {}", alias)),
            );
            if field.is_relationship {
                Expression::sql(format!("{} ->> 'id'", alias))
            } else {
                Expression::sql(format!("{} #>> '{{}}'", alias))
            }
        } else if field.is_relationship {
            base.clone()
                .then_sql("->")
                .then(field_name(field))
                .then_sql("->> 'id'")
        } else {
            base.clone().then_sql("->>").then(field_name(field))
        };

        if sources.is_empty() {
            return Ok(FieldExpression {
                expression: value,
                field,
                plural: false,
            });
        }

        let mut from = Expression::new();
        for (n, source) in sources.into_iter().enumerate() {
            if n > 0 {
                from.push_sql(",");
            }
            from.append(source);
        }
        return Ok(FieldExpression {
            expression: Expression::sql("array(select")
                .then(value)
                .then_sql("from")
                .then(from)
                .then_sql(")"),
            field,
            plural: true,
        });
    }

    Err(Error::InvalidQuery {
        message: "empty field path".to_string(),
        location: None,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::query::sql::query_to_sql;
    use crate::schema::model::models_from_value;
    use crate::schema::PluginRegistry;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    pub(crate) fn library() -> Schema {
        let models = models_from_value(json!([
            {"type": "content-types", "id": "articles", "relationships": {"fields": {"data": [
                {"type": "fields", "id": "title"},
                {"type": "fields", "id": "views"},
                {"type": "fields", "id": "tags"},
                {"type": "fields", "id": "author"},
                {"type": "fields", "id": "comments"}
            ]}}},
            {"type": "content-types", "id": "comments", "relationships": {"fields": {"data": [
                {"type": "fields", "id": "body"},
                {"type": "fields", "id": "author"},
                {"type": "fields", "id": "reactions"}
            ]}}},
            {"type": "fields", "id": "title", "attributes": {"field-type": "string"}},
            {"type": "fields", "id": "body", "attributes": {"field-type": "string"}},
            {"type": "fields", "id": "views", "attributes": {"field-type": "integer"}},
            {"type": "fields", "id": "tags", "attributes": {"field-type": "string-array"}},
            {"type": "fields", "id": "author", "attributes": {"field-type": "belongs-to"}},
            {"type": "fields", "id": "comments", "attributes": {"field-type": "has-many"}},
            {"type": "fields", "id": "reactions", "attributes": {"field-type": "has-many"}},
            {"type": "grants", "id": "read", "attributes": {"may-read-resource": true, "may-read-fields": true}}
        ]))
        .unwrap();
        Schema::load(models, Arc::new(PluginRegistry::with_builtins())).unwrap()
    }

    fn compile(path: &str) -> Result<(String, Vec<Param>, bool)> {
        let schema = library();
        let path = hubql::parse_field_path(path).unwrap();
        let fe = build_query_expression(&schema, &path)?;
        let q = query_to_sql(&fe.expression);
        Ok((q.text, q.values, fe.plural))
    }

    #[test]
    fn test_columns() {
        let (text, values, plural) = compile("type").unwrap();
        assert_eq!(text, "type");
        assert!(values.is_empty() && !plural);
    }

    #[test]
    fn test_scalar_attribute() {
        let (text, values, plural) = compile("title").unwrap();
        assert_eq!(text, "search_doc ->> $1");
        assert_eq!(values, vec![Param::Text("title".into())]);
        assert!(!plural);
    }

    #[test]
    fn test_belongs_to_traversal() {
        let (text, _, plural) = compile("author.id").unwrap();
        assert_eq!(text, "search_doc -> $1 ->> $2");
        assert!(!plural);
        let (text, _, _) = compile("author").unwrap();
        assert_eq!(text, "search_doc -> $1 ->> 'id'");
    }

    #[test]
    fn test_has_many_traversal_wraps_once() {
        let (text, values, plural) = compile("comments.reactions.id").unwrap();
        assert_eq!(
            text,
            "array(select e1 ->> $1 from jsonb_array_elements( search_doc -> $2 ) as e0 , jsonb_array_elements( e0 -> $3 ) as e1 )"
        );
        assert_eq!(values.len(), 3);
        assert!(plural);
    }

    #[test]
    fn test_plural_leaves() {
        let (text, _, plural) = compile("tags").unwrap();
        assert_eq!(text, "array(select e0 #>> '{}' from jsonb_array_elements( search_doc -> $1 ) as e0 )");
        assert!(plural);
        let (text, _, _) = compile("comments").unwrap();
        assert!(text.starts_with("array(select e0 ->> 'id'"));
    }

    #[test]
    fn test_bad_paths() {
        assert!(compile("nope").is_err());
        let err = compile("title.length").unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
