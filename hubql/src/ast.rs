//! Abstract Syntax Tree for hubql

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A complete search request: filter, sort and page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Optional filter (None matches everything)
    pub filter: Option<Filter>,
    /// Explicit sorts, in priority order
    pub sort: Vec<Sort>,
    /// Page size and cursor
    pub page: Page,
}

/// A dotted path through fields, e.g. `author.name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    pub segments: Vec<String>,
}

impl FieldPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// The first segment
    pub fn head(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or("")
    }

    /// True for single-segment paths
    pub fn is_simple(&self) -> bool {
        self.segments.len() == 1
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

/// A filter tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Every sub-filter must match
    And(Vec<Filter>),
    /// At least one sub-filter must match
    Or(Vec<Filter>),
    /// Negation
    Not(Box<Filter>),
    /// A predicate applied to a field path
    Field { path: FieldPath, predicate: Predicate },
}

/// What a field filter asks of its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Full-text match
    Text(String),
    /// Any of the listed predicates
    Any(Vec<Predicate>),
    /// Exact match; an array value means "any of these"
    Exact(Value),
    /// Ordered comparison
    Range(Range),
    /// Presence test
    Exists(bool),
    /// Word-prefix match
    Prefix(String),
}

/// Bounds of a range filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub lt: Option<Value>,
    pub lte: Option<Value>,
    pub gt: Option<Value>,
    pub gte: Option<Value>,
}

impl Range {
    /// The bounds that are set, paired with their SQL comparison operator
    pub fn bounds(&self) -> Vec<(&'static str, &Value)> {
        let mut out = Vec::new();
        if let Some(v) = &self.lt {
            out.push(("<", v));
        }
        if let Some(v) = &self.lte {
            out.push(("<=", v));
        }
        if let Some(v) = &self.gt {
            out.push((">", v));
        }
        if let Some(v) = &self.gte {
            out.push((">=", v));
        }
        out
    }
}

/// A single sort key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub path: FieldPath,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl Default for SortDirection {
    fn default() -> Self {
        Self::Asc
    }
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// Page request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Requested page size (None = server default)
    pub size: Option<usize>,
    /// Opaque cursor returned by a previous page
    pub cursor: Option<String>,
}
