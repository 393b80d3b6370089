//! Search and update statement generation.
//!
//! The builder is pure: identical options always produce identical text.
//! A row matches when ANY selected column matches, so per-column predicates
//! are joined with `OR`; update assignments are joined with `,`.

use super::escape::{escape_like_wildcards, quote_identifier, quote_literal};
use crate::error::SplaceError;
use crate::models::MatchMode;
use crate::Result;

/// Which statement to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind<'a> {
    /// `SELECT * ... WHERE ... [LIMIT]`
    Select,
    /// `UPDATE ... SET ... WHERE ... [LIMIT]`
    Update {
        /// Text written in place of the match.
        replacement: &'a str,
    },
}

/// Inputs for a single generated statement.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions<'a> {
    /// Table the statement reads or rewrites.
    pub table: &'a str,
    /// Columns compared against `search`, joined with `OR`.
    pub columns: &'a [String],
    /// Comparison used in the `WHERE` clause and, for updates, the `SET`.
    pub mode: MatchMode,
    /// Text or pattern to match.
    pub search: &'a str,
    /// Rows to skip. Only valid for `SELECT`.
    pub offset: u64,
    /// Maximum rows touched by the statement; `0` means unbounded.
    pub limit: u64,
    /// Whether a `SELECT` or an `UPDATE` is generated.
    pub kind: StatementKind<'a>,
}

impl<'a> QueryOptions<'a> {
    /// Options for a `SELECT` page.
    pub const fn select(
        table: &'a str,
        columns: &'a [String],
        mode: MatchMode,
        search: &'a str,
    ) -> Self {
        Self {
            table,
            columns,
            mode,
            search,
            offset: 0,
            limit: 0,
            kind: StatementKind::Select,
        }
    }

    /// Options for a capped `UPDATE`.
    pub const fn update(
        table: &'a str,
        columns: &'a [String],
        mode: MatchMode,
        search: &'a str,
        replacement: &'a str,
    ) -> Self {
        Self {
            table,
            columns,
            mode,
            search,
            offset: 0,
            limit: 0,
            kind: StatementKind::Update { replacement },
        }
    }

    /// Builder method to set the row cap.
    pub const fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Builder method to set the page offset.
    pub const fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

/// Builds one SQL statement.
///
/// # Errors
/// Returns a configuration error when no columns are given, when `LIKE`
/// mode is used for an update, or when an update carries an offset.
///
/// # Example
/// ```rust
/// use splace_core::sql::{build, QueryOptions};
/// use splace_core::MatchMode;
///
/// let columns = vec!["name".to_string(), "address".to_string()];
/// let sql = build(
///     &QueryOptions::select("people", &columns, MatchMode::Equals, "Dvid").with_limit(1000),
/// )
/// .unwrap();
/// assert_eq!(
///     sql,
///     "SELECT * FROM `people` WHERE `name` = 'Dvid' OR `address` = 'Dvid' LIMIT 1000"
/// );
/// ```
pub fn build(options: &QueryOptions<'_>) -> Result<String> {
    if options.columns.is_empty() {
        return Err(SplaceError::configuration(format!(
            "no columns selected for table '{}'",
            options.table
        )));
    }

    let table = quote_identifier(options.table);
    let mut sql = match options.kind {
        StatementKind::Select => format!("SELECT * FROM {table} WHERE "),
        StatementKind::Update { replacement } => {
            if options.offset > 0 {
                return Err(SplaceError::configuration(
                    "UPDATE statements cannot skip rows with an offset",
                ));
            }
            let assignments = set_clause(options.columns, options.mode, options.search, replacement)?;
            format!("UPDATE {table} SET {assignments} WHERE ")
        }
    };

    sql.push_str(&where_clause(options.columns, options.mode, options.search));

    if options.limit > 0 {
        if options.offset > 0 {
            sql.push_str(&format!(" LIMIT {},{}", options.offset, options.limit));
        } else {
            sql.push_str(&format!(" LIMIT {}", options.limit));
        }
    }

    Ok(sql)
}

fn where_clause(columns: &[String], mode: MatchMode, search: &str) -> String {
    let (operator, operand) = match mode {
        MatchMode::Equals => ("=", quote_literal(search)),
        MatchMode::Contains => (
            "LIKE BINARY",
            quote_literal(&format!("%{}%", escape_like_wildcards(search))),
        ),
        MatchMode::Like => ("LIKE BINARY", quote_literal(search)),
        MatchMode::Regexp => ("REGEXP", quote_literal(search)),
    };

    columns
        .iter()
        .map(|column| format!("{} {operator} {operand}", quote_identifier(column)))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn set_clause(columns: &[String], mode: MatchMode, search: &str, replacement: &str) -> Result<String> {
    let search = quote_literal(search);
    let replacement = quote_literal(replacement);

    let assignments = columns
        .iter()
        .map(|column| {
            let column = quote_identifier(column);
            let value = match mode {
                MatchMode::Equals => replacement.clone(),
                MatchMode::Contains => format!("REPLACE({column}, {search}, {replacement})"),
                MatchMode::Regexp => format!("REGEXP_REPLACE({column}, {search}, {replacement})"),
                MatchMode::Like => {
                    return Err(SplaceError::configuration(
                        "LIKE patterns have no substitution target and cannot be used to replace",
                    ));
                }
            };
            Ok(format!("{column} = {value}"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(assignments.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people_columns() -> Vec<String> {
        vec!["name".to_string(), "address".to_string()]
    }

    #[test]
    fn test_select_equals() {
        let columns = people_columns();
        let sql = build(
            &QueryOptions::select("people", &columns, MatchMode::Equals, "Dvid").with_limit(1000),
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM `people` WHERE `name` = 'Dvid' OR `address` = 'Dvid' LIMIT 1000"
        );
    }

    #[test]
    fn test_update_equals() {
        let columns = people_columns();
        let sql = build(
            &QueryOptions::update("people", &columns, MatchMode::Equals, "Dvid", "David")
                .with_limit(1000),
        )
        .unwrap();
        assert_eq!(
            sql,
            "UPDATE `people` SET `name` = 'David', `address` = 'David' \
             WHERE `name` = 'Dvid' OR `address` = 'Dvid' LIMIT 1000"
        );
    }

    #[test]
    fn test_select_with_offset() {
        let columns = vec!["name".to_string()];
        let sql = build(
            &QueryOptions::select("people", &columns, MatchMode::Equals, "Dvid")
                .with_offset(2000)
                .with_limit(1000),
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM `people` WHERE `name` = 'Dvid' LIMIT 2000,1000");
    }

    #[test]
    fn test_zero_limit_has_no_limit_clause() {
        let columns = vec!["name".to_string()];
        let sql = build(&QueryOptions::select("people", &columns, MatchMode::Equals, "x")).unwrap();
        assert!(!sql.contains("LIMIT"));
    }

    #[test]
    fn test_contains_escapes_wildcards_in_pattern() {
        let columns = vec!["title".to_string()];
        let sql = build(&QueryOptions::select("posts", &columns, MatchMode::Contains, "50%_off"))
            .unwrap();
        assert_eq!(
            sql,
            r"SELECT * FROM `posts` WHERE `title` LIKE BINARY '%50\\%\\_off%'"
        );
    }

    #[test]
    fn test_like_keeps_user_wildcards() {
        let columns = vec!["title".to_string()];
        let sql =
            build(&QueryOptions::select("posts", &columns, MatchMode::Like, "%Dvid_")).unwrap();
        assert_eq!(sql, "SELECT * FROM `posts` WHERE `title` LIKE BINARY '%Dvid_'");
    }

    #[test]
    fn test_contains_update_uses_replace() {
        let columns = vec!["body".to_string()];
        let sql = build(
            &QueryOptions::update("posts", &columns, MatchMode::Contains, "http://", "https://")
                .with_limit(500),
        )
        .unwrap();
        assert_eq!(
            sql,
            "UPDATE `posts` SET `body` = REPLACE(`body`, 'http://', 'https://') \
             WHERE `body` LIKE BINARY '%http://%' LIMIT 500"
        );
    }

    #[test]
    fn test_regexp_update_uses_regexp_replace() {
        let columns = vec!["body".to_string()];
        let sql = build(&QueryOptions::update(
            "posts",
            &columns,
            MatchMode::Regexp,
            "colou?r",
            "color",
        ))
        .unwrap();
        assert_eq!(
            sql,
            "UPDATE `posts` SET `body` = REGEXP_REPLACE(`body`, 'colou?r', 'color') \
             WHERE `body` REGEXP 'colou?r'"
        );
    }

    #[test]
    fn test_like_update_is_rejected() {
        let columns = people_columns();
        let result = build(&QueryOptions::update(
            "people",
            &columns,
            MatchMode::Like,
            "%x%",
            "y",
        ));
        assert!(matches!(result, Err(SplaceError::Configuration { .. })));
    }

    #[test]
    fn test_update_with_offset_is_rejected() {
        let columns = people_columns();
        let result = build(
            &QueryOptions::update("people", &columns, MatchMode::Equals, "a", "b").with_offset(10),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_columns_rejected() {
        let result = build(&QueryOptions::select("people", &[], MatchMode::Equals, "x"));
        assert!(result.is_err());
    }

    #[test]
    fn test_hostile_values_are_escaped() {
        let columns = vec!["na`me".to_string()];
        let sql = build(
            &QueryOptions::update("t", &columns, MatchMode::Equals, "a'; DROP TABLE t; --", "b\\")
                .with_limit(1),
        )
        .unwrap();
        assert_eq!(
            sql,
            r"UPDATE `t` SET `na``me` = 'b\\' WHERE `na``me` = 'a\'; DROP TABLE t; --' LIMIT 1"
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let columns = people_columns();
        let options = QueryOptions::select("people", &columns, MatchMode::Regexp, "^D.*d$")
            .with_offset(5)
            .with_limit(5);
        assert_eq!(build(&options).unwrap(), build(&options).unwrap());
    }
}
