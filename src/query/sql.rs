//! SQL expressions as token lists
//!
//! An expression is a list of SQL fragments and bound parameters. Values
//! only ever enter an expression as parameters; `query_to_sql` numbers
//! them `$1..$n` and returns the values alongside the text.

use serde_json::Value;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

/// A bound parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    TextArray(Vec<String>),
    Json(Value),
    BigInt(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Sql(String),
    Param(Param),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expression(pub Vec<Token>);

impl Expression {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bare SQL fragment
    pub fn sql(fragment: impl Into<String>) -> Self {
        Self(vec![Token::Sql(fragment.into())])
    }

    pub fn param(param: Param) -> Self {
        Self(vec![Token::Param(param)])
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::param(Param::Text(value.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push_sql(&mut self, fragment: impl Into<String>) -> &mut Self {
        self.0.push(Token::Sql(fragment.into()));
        self
    }

    pub fn push_param(&mut self, param: Param) -> &mut Self {
        self.0.push(Token::Param(param));
        self
    }

    pub fn append(&mut self, other: Expression) -> &mut Self {
        self.0.extend(other.0);
        self
    }

    /// Builder form of `push_sql`
    pub fn then_sql(mut self, fragment: impl Into<String>) -> Self {
        self.push_sql(fragment);
        self
    }

    /// Builder form of `push_param`
    pub fn then_param(mut self, param: Param) -> Self {
        self.push_param(param);
        self
    }

    /// Builder form of `append`
    pub fn then(mut self, other: Expression) -> Self {
        self.append(other);
        self
    }

    /// `( self )`
    pub fn parenthesized(self) -> Self {
        Expression::sql("(").then(self).then_sql(")")
    }

    /// Parameters in order of appearance
    pub fn params(&self) -> impl Iterator<Item = &Param> {
        self.0.iter().filter_map(|t| match t {
            Token::Param(p) => Some(p),
            Token::Sql(_) => None,
        })
    }
}

fn join(expressions: Vec<Expression>, operator: &str, identity: &str) -> Expression {
    if expressions.is_empty() {
        return Expression::sql(identity);
    }
    let mut out = Expression::sql("(");
    for (i, expression) in expressions.into_iter().enumerate() {
        if i > 0 {
            out.push_sql(operator);
        }
        out.append(expression.parenthesized());
    }
    out.push_sql(")");
    out
}

/// Disjunction; `false` when empty
pub fn any(expressions: Vec<Expression>) -> Expression {
    join(expressions, "OR", "false")
}

/// Conjunction; `true` when empty
pub fn every(expressions: Vec<Expression>) -> Expression {
    join(expressions, "AND", "true")
}

/// Negation
pub fn not(expression: Expression) -> Expression {
    Expression::sql("NOT").then(expression.parenthesized())
}

/// Parameterized SQL text plus its values
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub text: String,
    pub values: Vec<Param>,
}

impl SqlQuery {
    /// A `sqlx` query with every value bound in order
    pub fn bind(&self) -> Query<'_, Postgres, PgArguments> {
        let mut query = sqlx::query(&self.text);
        for value in &self.values {
            query = match value {
                Param::Text(s) => query.bind(s.clone()),
                Param::TextArray(items) => query.bind(items.clone()),
                Param::Json(v) => query.bind(v.clone()),
                Param::BigInt(n) => query.bind(*n),
            };
        }
        query
    }
}

/// Number the parameters and render the text
pub fn query_to_sql(expression: &Expression) -> SqlQuery {
    let mut text = String::new();
    let mut values = Vec::new();
    for token in &expression.0 {
        if !text.is_empty() {
            text.push(' ');
        }
        match token {
            Token::Sql(fragment) => text.push_str(fragment),
            Token::Param(param) => {
                values.push(param.clone());
                text.push_str(&format!("${}", values.len()));
            }
        }
    }
    SqlQuery { text, values }
}

/// Text form of a scalar JSON value, as bound for comparisons
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
