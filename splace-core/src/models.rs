//! Core data model shared by the drivers, the query builder and both engines.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Supported database engines.
///
/// Only the MySQL family is implemented; the others are accepted in
/// configuration and fail with an unsupported-engine error when used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    MySql,
    PostgreSql,
    SqlServer,
    Oracle,
}

impl Engine {
    /// All engines, in declaration order.
    pub const ALL: [Self; 4] = [Self::MySql, Self::PostgreSql, Self::SqlServer, Self::Oracle];

    /// URL scheme used by this engine's connection strings.
    pub const fn scheme(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::PostgreSql => "postgres",
            Self::SqlServer => "mssql",
            Self::Oracle => "oracle",
        }
    }

    /// Default TCP port of the engine.
    pub const fn default_port(self) -> u16 {
        match self {
            Self::MySql => 3306,
            Self::PostgreSql => 5432,
            Self::SqlServer => 1433,
            Self::Oracle => 1521,
        }
    }

    /// Whether the drivers and query builder implement this engine.
    pub const fn is_supported(self) -> bool {
        matches!(self, Self::MySql)
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MySql => write!(f, "MySQL"),
            Self::PostgreSql => write!(f, "PostgreSQL"),
            Self::SqlServer => write!(f, "SQL Server"),
            Self::Oracle => write!(f, "Oracle"),
        }
    }
}

impl FromStr for Engine {
    type Err = crate::SplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" => Ok(Self::PostgreSql),
            "mssql" | "sqlserver" => Ok(Self::SqlServer),
            "oracle" => Ok(Self::Oracle),
            other => Err(crate::SplaceError::configuration(format!(
                "unknown database engine '{other}'"
            ))),
        }
    }
}

/// Comparison semantics applied when testing or rewriting a column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Whole value equals the pattern.
    #[default]
    Equals,
    /// Value contains the pattern as a literal substring.
    Contains,
    /// Value matches a user-supplied `LIKE` wildcard pattern. Search only.
    Like,
    /// Value matches a regular expression.
    Regexp,
}

impl MatchMode {
    /// Whether the mode defines a substitution target for an `UPDATE`.
    pub const fn supports_replace(self) -> bool {
        !matches!(self, Self::Like)
    }
}

impl std::fmt::Display for MatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Equals => "equals",
            Self::Contains => "contains",
            Self::Like => "like",
            Self::Regexp => "regexp",
        };
        f.write_str(name)
    }
}

impl FromStr for MatchMode {
    type Err = crate::SplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "equals" | "exact" => Ok(Self::Equals),
            "contains" => Ok(Self::Contains),
            "like" => Ok(Self::Like),
            "regexp" | "regex" => Ok(Self::Regexp),
            other => Err(crate::SplaceError::configuration(format!(
                "unknown match mode '{other}'"
            ))),
        }
    }
}

/// A column as reported by the system catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared type exactly as the catalog reports it, e.g. `varchar(255)`.
    #[serde(rename = "type")]
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }

    /// Whether replacement text may be written into this column.
    pub fn is_replaceable(&self) -> bool {
        crate::schema::is_column_type_replaceable(&self.type_name)
    }
}

/// Discovered schema snapshot: table name to its columns in catalog order.
///
/// Built once per connection and never refreshed.
pub type TableMap = BTreeMap<String, Vec<ColumnInfo>>;

/// Selected table names mapped to the selected column names of each table.
pub type TableSelection = BTreeMap<String, Vec<String>>;

/// Builds a selection covering every column of every discovered table.
pub fn select_all(tables: &TableMap) -> TableSelection {
    tables
        .iter()
        .map(|(table, columns)| {
            (
                table.clone(),
                columns.iter().map(|c| c.name.clone()).collect(),
            )
        })
        .collect()
}

/// Lifecycle of a search or replace run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunState {
    /// Whether the run has reached a final state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}
