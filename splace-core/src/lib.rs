//! Core library for splace, a find-and-replace tool for MySQL databases.
//!
//! This crate provides the database access abstraction, SQL generation and
//! the concurrent search and replace engines consumed by the `splace`
//! binary. Every engine emits its progress through bounded channels, so a
//! slow consumer throttles the producers instead of growing memory.
//!
//! # Security Guarantees
//! - No credentials logged or printed by any data structure
//! - Every string embedded in generated SQL is escaped
//! - Passwords and proxy secrets are zeroed on drop
//!
//! # Architecture
//! - `querier`: the access abstraction with Direct (sqlx) and Proxy (HTTP)
//!   drivers chosen through a factory
//! - `sql`: pure statement builder and escaping primitives
//! - `schema`: catalog discovery into a [`TableMap`]
//! - `search` / `replace`: the two engines, reporting through `run`
//! - `session`: [`Splace`], binding one querier to its schema snapshot

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod querier;
pub mod replace;
pub mod run;
pub mod schema;
pub mod search;
pub mod session;
pub mod sql;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{Result, SplaceError};
pub use models::{
    ColumnInfo, Engine, MatchMode, RunState, TableMap, TableSelection, select_all,
};
pub use querier::{
    ConnectionConfig, DirectOptions, DiscoveredConfig, DriverConfig, ProxyOptions, Querier,
    RowCursor, connect,
};
pub use replace::{ReplaceHandle, ReplaceOptions, ReplaceResult};
pub use run::Completion;
pub use search::{SearchHandle, SearchOptions, SearchResult};
pub use session::Splace;
