//! Schema discovery through the system catalog.
//!
//! One query against `INFORMATION_SCHEMA.COLUMNS` yields every
//! (table, column, declared type) triple of the active database, folded
//! into a [`TableMap`]. Declared types decide which columns a replace may
//! write to.

use crate::error::SplaceError;
use crate::models::{ColumnInfo, TableMap};
use crate::querier::Querier;
use crate::Result;
use regex::Regex;
use std::sync::OnceLock;

const CATALOG_QUERY: &str = "SELECT CAST(TABLE_NAME AS CHAR), CAST(COLUMN_NAME AS CHAR), \
     CAST(COLUMN_TYPE AS CHAR) FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = ? ORDER BY TABLE_NAME, ORDINAL_POSITION";

#[allow(clippy::expect_used)]
fn temporal_type_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(date|time|datetime|timestamp)(\(\d+\))?$")
            .expect("Invalid temporal type pattern")
    })
}

/// Whether replacement text may be written into a column of this declared
/// type.
///
/// Date and time family types are excluded because arbitrary replacement
/// text fails the engine's type validation. Everything else is eligible.
///
/// ```rust
/// use splace_core::schema::is_column_type_replaceable;
///
/// assert!(is_column_type_replaceable("varchar(255)"));
/// assert!(!is_column_type_replaceable("datetime(6)"));
/// ```
pub fn is_column_type_replaceable(type_name: &str) -> bool {
    !temporal_type_pattern().is_match(type_name.trim())
}

/// Reads the catalog of the querier's database into a [`TableMap`].
///
/// Columns keep their catalog (ordinal) order.
///
/// # Errors
/// Any failure here is fatal to the connection attempt: the catalog query
/// error is returned unchanged, and rows that do not carry exactly three
/// values produce a protocol error.
pub async fn discover(querier: &dyn Querier) -> Result<TableMap> {
    let database = querier.config().database.clone();
    tracing::debug!("Discovering tables of database '{}'", database);

    let mut cursor = querier.query(CATALOG_QUERY, &[database]).await?;
    let mut tables = TableMap::new();
    let mut column_count = 0usize;

    while cursor.advance().await? {
        let [table, column, type_name] = cursor.row() else {
            return Err(SplaceError::protocol(format!(
                "catalog row has {} values, expected 3",
                cursor.row().len()
            )));
        };
        tables
            .entry(table.clone())
            .or_default()
            .push(ColumnInfo::new(column.clone(), type_name.clone()));
        column_count = column_count.saturating_add(1);
    }

    tracing::info!(
        "Discovered {} tables with {} columns",
        tables.len(),
        column_count
    );
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporal_types_are_not_replaceable() {
        for type_name in [
            "date",
            "time",
            "datetime",
            "timestamp",
            "DATETIME",
            "datetime(6)",
            "timestamp(3)",
            "time(2)",
            " date ",
        ] {
            assert!(
                !is_column_type_replaceable(type_name),
                "{type_name} should not be replaceable"
            );
        }
    }

    #[test]
    fn test_other_types_are_replaceable() {
        for type_name in [
            "varchar(255)",
            "text",
            "longtext",
            "int(11)",
            "int unsigned",
            "enum('a','b')",
            "year",
            "blob",
            "json",
            "decimal(10,2)",
            "datetimex",
            "mediumtext",
        ] {
            assert!(
                is_column_type_replaceable(type_name),
                "{type_name} should be replaceable"
            );
        }
    }

    #[test]
    fn test_column_info_uses_type_classification() {
        assert!(ColumnInfo::new("title", "varchar(64)").is_replaceable());
        assert!(!ColumnInfo::new("created_at", "timestamp").is_replaceable());
    }
}
