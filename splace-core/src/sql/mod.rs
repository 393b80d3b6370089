//! SQL generation for the MySQL dialect.
//!
//! # Module Structure
//! - `escape`: literal, wildcard and identifier escaping
//! - `builder`: `SELECT`/`UPDATE` statement construction

pub mod builder;
pub mod escape;

pub use builder::{QueryOptions, StatementKind, build};
pub use escape::{escape_like_wildcards, escape_string, quote_identifier, quote_literal};
