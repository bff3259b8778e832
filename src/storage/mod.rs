//! Storage layer for dochub
//!
//! JSON:API documents, the Postgres tables they are indexed into, and the
//! generation-stamped indexing runs that keep those tables current.

pub mod document;
pub mod indexers;
pub mod pg;

pub use indexers::{IndexRun, Indexers};
pub use pg::{DocumentRow, PgClient};
