//! Batched replace, one table at a time.
//!
//! For each table a capped `UPDATE` is built once and executed until it
//! reports zero affected rows. Every execution rewrites the rows it
//! touched, so the next one reaches the following batch of matches.
//! Tables run sequentially; nothing here writes concurrently.
//!
//! Every statement commits on its own. A failure stops the run but keeps
//! what earlier statements already changed.

use crate::Result;
use crate::config::EngineConfig;
use crate::error::SplaceError;
use crate::models::{MatchMode, TableMap, TableSelection};
use crate::querier::Querier;
use crate::run::{self, Completion, Reporter};
use crate::sql::{QueryOptions, build};
use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What to replace and where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceOptions {
    /// Text or pattern to look for.
    pub search: String,
    /// Text written in place of each match.
    pub replace: String,
    /// How `search` is compared with column values.
    pub mode: MatchMode,
    /// Selected tables and, per table, the columns to rewrite.
    pub tables: TableSelection,
    /// Rows rewritten per statement. `0` runs one unbounded statement.
    pub limit: u64,
    /// Report the statements without executing them.
    #[serde(default)]
    pub dry_run: bool,
}

/// Header of one table's replacement, followed by its affected-row counts.
///
/// `affected_rows` carries one count per executed statement and closes
/// when the table is done. It closes without values on a dry run.
#[derive(Debug)]
pub struct ReplaceResult {
    /// Table being rewritten.
    pub table: String,
    /// The `UPDATE` executed for this table.
    pub sql: String,
    /// When the table was reached.
    pub start: DateTime<Utc>,
    /// Rows affected by each executed statement.
    pub affected_rows: mpsc::Receiver<u64>,
}

/// A running replace.
#[derive(Debug)]
pub struct ReplaceHandle {
    /// One header per table, in table order.
    pub results: mpsc::Receiver<ReplaceResult>,
    /// Final state and outcome of the run.
    pub completion: Completion,
}

impl ReplaceHandle {
    /// Next table header, or `None` once every table has reported.
    pub async fn next_result(&mut self) -> Option<ReplaceResult> {
        self.results.recv().await
    }

    /// Splits the handle so results and completion can be awaited from
    /// different tasks.
    pub fn into_parts(self) -> (mpsc::Receiver<ReplaceResult>, Completion) {
        (self.results, self.completion)
    }
}

/// One table's prepared statement.
#[derive(Debug)]
struct Batch {
    table: String,
    sql: String,
}

/// Starts a replace and returns immediately.
///
/// Columns whose declared type in `schema` is not replaceable (the date
/// and time family) are dropped from each table's selection; columns
/// missing from `schema` are kept. Tables left without columns are
/// skipped.
///
/// # Errors
/// Fails before any statement runs when:
/// - the mode is [`MatchMode::Like`], which has no substitution target
/// - a capped replace would never drain because the replacement still
///   matches the pattern
/// - `config` is invalid
pub fn start(
    querier: Arc<dyn Querier>,
    schema: &TableMap,
    options: ReplaceOptions,
    config: EngineConfig,
    cancel: &CancellationToken,
) -> Result<ReplaceHandle> {
    config.validate()?;
    if !options.mode.supports_replace() {
        return Err(SplaceError::configuration(format!(
            "{} mode cannot be used to replace",
            options.mode
        )));
    }
    if options.limit > 0 && replacement_still_matches(&options) {
        return Err(SplaceError::configuration(format!(
            "replacement '{}' still matches the {} pattern, so a capped replace would never finish; \
             use a limit of 0 to rewrite every match in one statement",
            options.replace, options.mode
        )));
    }

    let mut batches = Vec::new();
    for (table, columns) in &options.tables {
        let eligible: Vec<String> = columns
            .iter()
            .filter(|column| is_eligible(schema, table, column))
            .cloned()
            .collect();
        if eligible.is_empty() {
            tracing::debug!("Skipping table '{}': no replaceable columns selected", table);
            continue;
        }

        let sql = build(
            &QueryOptions::update(table, &eligible, options.mode, &options.search, &options.replace)
                .with_limit(options.limit),
        )?;
        batches.push(Batch {
            table: table.clone(),
            sql,
        });
    }

    let cancel = cancel.child_token();
    let (results_tx, results_rx) = mpsc::channel(config.result_buffer);
    let (reporter, completion) = run::channel(cancel.clone());

    tracing::info!(
        "Replacing in {} tables ({} mode, limit {}{})",
        batches.len(),
        options.mode,
        options.limit,
        if options.dry_run { ", dry run" } else { "" }
    );
    tokio::spawn(drive(
        querier,
        batches,
        options.limit,
        options.dry_run,
        config.row_buffer,
        results_tx,
        cancel,
        reporter,
    ));

    Ok(ReplaceHandle {
        results: results_rx,
        completion,
    })
}

fn is_eligible(schema: &TableMap, table: &str, column: &str) -> bool {
    schema
        .get(table)
        .and_then(|columns| columns.iter().find(|info| info.name == column))
        .is_none_or(|info| info.is_replaceable())
}

/// Whether rows would still match after being rewritten, which makes a
/// capped loop rewrite the same rows forever.
///
/// Matching follows the usual `_ci` collations: case is ignored, and `=`
/// also ignores trailing spaces. The server counts matched rows as
/// affected, so a rewrite that only changes case never drains.
fn replacement_still_matches(options: &ReplaceOptions) -> bool {
    match options.mode {
        MatchMode::Equals => collation_key(&options.replace) == collation_key(&options.search),
        MatchMode::Contains => options
            .replace
            .to_lowercase()
            .contains(&options.search.to_lowercase()),
        // Rust and MySQL regex dialects differ; only a pattern both accept
        // can be checked here.
        MatchMode::Regexp => RegexBuilder::new(&options.search)
            .case_insensitive(true)
            .build()
            .is_ok_and(|pattern| pattern.is_match(&options.replace)),
        MatchMode::Like => false,
    }
}

/// Equality key under a case-insensitive PAD SPACE collation.
fn collation_key(value: &str) -> String {
    value.trim_end_matches(' ').to_lowercase()
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    querier: Arc<dyn Querier>,
    batches: Vec<Batch>,
    limit: u64,
    dry_run: bool,
    row_buffer: usize,
    results: mpsc::Sender<ReplaceResult>,
    cancel: CancellationToken,
    reporter: Reporter,
) {
    reporter.running();

    let mut outcome = Ok(());
    for batch in batches {
        if cancel.is_cancelled() {
            outcome = Err(SplaceError::Canceled);
            break;
        }
        match replace_table(querier.as_ref(), &batch, limit, dry_run, row_buffer, &results, &cancel).await {
            Ok(()) => tracing::debug!("Finished replacing in '{}'", batch.table),
            Err(e) => {
                if !matches!(e, SplaceError::Canceled) {
                    tracing::warn!("Replace failed in table '{}': {}", batch.table, e);
                    cancel.cancel();
                }
                outcome = Err(e);
                break;
            }
        }
    }
    drop(results);

    match &outcome {
        Ok(()) => tracing::info!("Replace completed"),
        Err(e) => tracing::info!("Replace ended: {}", e),
    }
    reporter.finish(outcome);
}

async fn replace_table(
    querier: &dyn Querier,
    batch: &Batch,
    limit: u64,
    dry_run: bool,
    row_buffer: usize,
    results: &mpsc::Sender<ReplaceResult>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (tx, rx) = mpsc::channel(row_buffer);
    let header = ReplaceResult {
        table: batch.table.clone(),
        sql: batch.sql.clone(),
        start: Utc::now(),
        affected_rows: rx,
    };
    tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(SplaceError::Canceled),
        sent = results.send(header) => {
            if sent.is_err() {
                // Nobody is watching; stop before changing anything else.
                return Err(SplaceError::Canceled);
            }
        }
    }

    if dry_run {
        tracing::debug!("Dry run for '{}': {}", batch.table, batch.sql);
        return Ok(());
    }

    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(SplaceError::Canceled);
        }

        let affected = querier.exec(&batch.sql, &[]).await?;
        total = total.saturating_add(affected);
        tracing::trace!("Rewrote {} rows in '{}'", affected, batch.table);

        // The statement has committed, so its count is reported even when
        // cancellation arrives meanwhile. A dropped count stream does not
        // stop the rewrite.
        tokio::select! {
            biased;
            _ = tx.send(affected) => {}
            () = cancel.cancelled() => {
                let _ = tx.try_send(affected);
                return Err(SplaceError::Canceled);
            }
        }
        if cancel.is_cancelled() {
            return Err(SplaceError::Canceled);
        }

        if affected == 0 || limit == 0 {
            break;
        }
    }

    tracing::debug!("Rewrote {} rows in '{}' in total", total, batch.table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnInfo;

    fn options(mode: MatchMode, search: &str, replace: &str) -> ReplaceOptions {
        ReplaceOptions {
            search: search.to_string(),
            replace: replace.to_string(),
            mode,
            limit: 100,
            ..ReplaceOptions::default()
        }
    }

    #[test]
    fn test_non_draining_replacements_detected() {
        assert!(replacement_still_matches(&options(MatchMode::Equals, "a", "a")));
        assert!(!replacement_still_matches(&options(MatchMode::Equals, "a", "b")));

        assert!(replacement_still_matches(&options(MatchMode::Contains, "http", "https")));
        assert!(replacement_still_matches(&options(MatchMode::Contains, "", "x")));
        assert!(!replacement_still_matches(&options(MatchMode::Contains, "https", "http")));

        assert!(replacement_still_matches(&options(MatchMode::Regexp, "colou?r", "color")));
        assert!(!replacement_still_matches(&options(MatchMode::Regexp, "^D[a-z]+d$", "X")));
        // Patterns Rust cannot compile are left to the server.
        assert!(!replacement_still_matches(&options(MatchMode::Regexp, "(", "(")));
    }

    #[test]
    fn test_guard_follows_case_insensitive_collations() {
        assert!(replacement_still_matches(&options(MatchMode::Equals, "dvid", "Dvid")));
        assert!(replacement_still_matches(&options(MatchMode::Equals, "x", "x ")));
        assert!(replacement_still_matches(&options(MatchMode::Equals, "x  ", "X")));
        assert!(!replacement_still_matches(&options(MatchMode::Equals, "x", " x")));

        assert!(replacement_still_matches(&options(MatchMode::Contains, "HTTP", "https://")));
        assert!(replacement_still_matches(&options(MatchMode::Regexp, "dvid", "DVID")));
    }

    #[test]
    fn test_column_eligibility() {
        let mut schema = TableMap::new();
        schema.insert(
            "posts".to_string(),
            vec![
                ColumnInfo::new("body", "longtext"),
                ColumnInfo::new("published", "datetime"),
            ],
        );

        assert!(is_eligible(&schema, "posts", "body"));
        assert!(!is_eligible(&schema, "posts", "published"));
        assert!(is_eligible(&schema, "posts", "unknown"));
        assert!(is_eligible(&schema, "other", "anything"));
    }
}
