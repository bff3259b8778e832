//! Query compilation for dochub
//!
//! Compiles hubql filters, sorts and pages into parameterized SQL over the
//! documents table and assembles result pages.

pub mod expression;
pub mod filter;
pub mod searcher;
pub mod sort;
pub mod sql;

pub use searcher::{SearchPage, Searcher};
pub use sql::{query_to_sql, Expression, SqlQuery};
