//! Concurrent, paginated search across tables.
//!
//! A coordinator task drives a bounded pool of table scanners
//! (`buffer_unordered`). Each scanner pages through its table with
//! `LIMIT offset,limit` and forwards matches into that table's own bounded
//! row stream, so a slow consumer throttles the scanner feeding it.
//!
//! The first failing scanner trips the run's cancellation token; the
//! others notice before their next page query and stop. The coordinator
//! alone records the outcome, keeping the first error.

use crate::Result;
use crate::config::EngineConfig;
use crate::error::SplaceError;
use crate::models::{MatchMode, TableSelection};
use crate::querier::Querier;
use crate::run::{self, Completion, Reporter};
use crate::sql::{QueryOptions, build};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What to search for and where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Text or pattern to look for.
    pub search: String,
    /// How `search` is compared with column values.
    pub mode: MatchMode,
    /// Selected tables and, per table, the columns to match against.
    pub tables: TableSelection,
    /// Rows fetched per page query. `0` fetches everything in one query.
    pub limit: u64,
}

/// Header of one table's matches, followed by its row stream.
///
/// `rows` closes when the table is done, whether it finished, failed or
/// was canceled; the run's [`Completion`] tells which.
#[derive(Debug)]
pub struct SearchResult {
    /// Table the rows come from.
    pub table: String,
    /// Statement of the first page.
    pub sql: String,
    /// Column names, in row order.
    pub columns: Vec<String>,
    /// When the first page was requested.
    pub start: DateTime<Utc>,
    /// Matching rows, one string per column.
    pub rows: mpsc::Receiver<Vec<String>>,
}

/// A running search.
#[derive(Debug)]
pub struct SearchHandle {
    /// One header per table that returned a first page, in completion
    /// order.
    pub results: mpsc::Receiver<SearchResult>,
    /// Final state and outcome of the run.
    pub completion: Completion,
}

impl SearchHandle {
    /// Next table header, or `None` once every table has reported.
    pub async fn next_result(&mut self) -> Option<SearchResult> {
        self.results.recv().await
    }

    /// Splits the handle so results and completion can be awaited from
    /// different tasks.
    pub fn into_parts(self) -> (mpsc::Receiver<SearchResult>, Completion) {
        (self.results, self.completion)
    }
}

/// Immutable inputs shared by every scanner of one run.
struct ScanContext {
    querier: Arc<dyn Querier>,
    search: String,
    mode: MatchMode,
    limit: u64,
    row_buffer: usize,
    results: mpsc::Sender<SearchResult>,
    cancel: CancellationToken,
}

/// How a scanner ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanEnd {
    Finished,
    Stopped,
}

/// Starts a search and returns immediately.
///
/// Tables whose column selection is empty are skipped without a query.
/// The run stops when `cancel` (or the returned completion) is canceled.
///
/// # Errors
/// Returns a configuration error for an invalid `config`; nothing is
/// queried in that case.
pub fn start(
    querier: Arc<dyn Querier>,
    options: SearchOptions,
    config: EngineConfig,
    cancel: &CancellationToken,
) -> Result<SearchHandle> {
    config.validate()?;

    let units: Vec<(String, Vec<String>)> = options
        .tables
        .into_iter()
        .filter(|(table, columns)| {
            if columns.is_empty() {
                tracing::debug!("Skipping table '{}': no columns selected", table);
            }
            !columns.is_empty()
        })
        .collect();

    let cancel = cancel.child_token();
    let (results_tx, results_rx) = mpsc::channel(config.result_buffer);
    let (reporter, completion) = run::channel(cancel.clone());

    let context = Arc::new(ScanContext {
        querier,
        search: options.search,
        mode: options.mode,
        limit: options.limit,
        row_buffer: config.row_buffer,
        results: results_tx,
        cancel,
    });

    tracing::info!(
        "Searching {} tables ({} mode, limit {}, {} workers)",
        units.len(),
        context.mode,
        context.limit,
        config.workers
    );
    tokio::spawn(coordinate(context, units, config.workers, reporter));

    Ok(SearchHandle {
        results: results_rx,
        completion,
    })
}

async fn coordinate(
    context: Arc<ScanContext>,
    units: Vec<(String, Vec<String>)>,
    workers: usize,
    reporter: Reporter,
) {
    reporter.running();
    let cancel = context.cancel.clone();

    let scans = units.into_iter().map(move |(table, columns)| {
        let context = Arc::clone(&context);
        async move {
            let outcome = scan_table(&context, &table, &columns).await;
            if outcome.is_err() {
                context.cancel.cancel();
            }
            (table, outcome)
        }
    });

    let mut first_error = None;
    let mut stopped = false;
    let mut stream = stream::iter(scans).buffer_unordered(workers);
    while let Some((table, outcome)) = stream.next().await {
        match outcome {
            Ok(ScanEnd::Finished) => tracing::debug!("Finished scanning '{}'", table),
            Ok(ScanEnd::Stopped) => {
                tracing::debug!("Stopped scanning '{}'", table);
                stopped = true;
            }
            Err(e) => {
                if first_error.is_none() {
                    tracing::warn!("Search failed in table '{}': {}", table, e);
                    first_error = Some(e);
                } else {
                    tracing::debug!("Further search failure in table '{}': {}", table, e);
                }
            }
        }
    }
    // Closes the result stream before the completion fires.
    drop(stream);

    let outcome = match first_error {
        Some(e) => Err(e),
        None if stopped && cancel.is_cancelled() => Err(SplaceError::Canceled),
        None => Ok(()),
    };
    match &outcome {
        Ok(()) => tracing::info!("Search completed"),
        Err(e) => tracing::info!("Search ended: {}", e),
    }
    reporter.finish(outcome);
}

/// Pages through one table until a short or empty page.
async fn scan_table(context: &ScanContext, table: &str, columns: &[String]) -> Result<ScanEnd> {
    let start = Utc::now();
    let mut rows_tx: Option<mpsc::Sender<Vec<String>>> = None;
    let mut offset = 0u64;

    tracing::debug!("Scanning '{}' ({} columns)", table, columns.len());
    loop {
        if context.cancel.is_cancelled() {
            return Ok(ScanEnd::Stopped);
        }

        let sql = build(
            &QueryOptions::select(table, columns, context.mode, &context.search)
                .with_offset(offset)
                .with_limit(context.limit),
        )?;
        tracing::trace!("Querying '{}' at offset {}", table, offset);
        let mut cursor = context.querier.query(&sql, &[]).await?;

        let tx = match &rows_tx {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::channel(context.row_buffer);
                let header = SearchResult {
                    table: table.to_string(),
                    sql,
                    columns: cursor.columns().to_vec(),
                    start,
                    rows: rx,
                };
                tokio::select! {
                    biased;
                    () = context.cancel.cancelled() => return Ok(ScanEnd::Stopped),
                    sent = context.results.send(header) => {
                        if sent.is_err() {
                            // Nobody is listening for results any more.
                            return Ok(ScanEnd::Stopped);
                        }
                    }
                }
                rows_tx = Some(tx.clone());
                tx
            }
        };

        let mut page_rows = 0u64;
        while cursor.advance().await? {
            page_rows = page_rows.saturating_add(1);
            let row = cursor.row().to_vec();
            tokio::select! {
                biased;
                () = context.cancel.cancelled() => return Ok(ScanEnd::Stopped),
                sent = tx.send(row) => {
                    if sent.is_err() {
                        tracing::debug!("Row stream of '{}' dropped by consumer", table);
                        return Ok(ScanEnd::Finished);
                    }
                }
            }
        }

        if context.limit == 0 || page_rows < context.limit {
            return Ok(ScanEnd::Finished);
        }
        offset = offset
            .checked_add(context.limit)
            .ok_or_else(|| SplaceError::configuration("search offset overflowed"))?;
    }
}
