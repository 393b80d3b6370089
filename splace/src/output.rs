//! JSON-lines output of search and replace runs.
//!
//! Every line is one event tagged by `type`. A table header is written as
//! soon as the engine reports the table; its rows or affected counts are
//! then drained by a task of their own, so a busy table never holds back
//! the output of the others.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use splace_core::{ReplaceHandle, ReplaceResult, RunState, SearchHandle, SearchResult};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// One output line.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event<'a> {
    /// A table started reporting.
    Table {
        table: &'a str,
        sql: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        columns: Option<&'a [String]>,
        start: DateTime<Utc>,
    },
    /// A matching row of a searched table.
    Row { table: &'a str, values: &'a [String] },
    /// Rows rewritten by one executed statement.
    Affected { table: &'a str, rows: u64 },
    /// A table's stream closed; `count` is the rows seen or rewritten.
    Finished { table: &'a str, count: u64 },
    /// The run ended.
    Done {
        state: RunState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Serializes events onto a shared writer, one line each.
pub struct Printer<W> {
    out: Arc<Mutex<W>>,
}

impl<W> Clone for Printer<W> {
    fn clone(&self) -> Self {
        Self {
            out: Arc::clone(&self.out),
        }
    }
}

impl<W> Printer<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(out: W) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
        }
    }

    /// Writes one event and flushes it.
    pub async fn emit(&self, event: &Event<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("Failed to encode output event")?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line).await.context("Failed to write output")?;
        out.flush().await.context("Failed to flush output")
    }

    /// Prints a search run until it ends.
    ///
    /// # Errors
    /// Returns the run's error after its `done` line, or the first output
    /// failure.
    pub async fn search(&self, handle: SearchHandle) -> Result<()> {
        let (mut results, completion) = handle.into_parts();
        let state = completion.subscribe();
        let mut tables = JoinSet::new();

        while let Some(result) = results.recv().await {
            let SearchResult {
                table,
                sql,
                columns,
                start,
                mut rows,
            } = result;
            self.emit(&Event::Table {
                table: &table,
                sql: &sql,
                columns: Some(&columns),
                start,
            })
            .await?;

            let printer = self.clone();
            tables.spawn(async move {
                let mut count = 0u64;
                while let Some(row) = rows.recv().await {
                    printer
                        .emit(&Event::Row {
                            table: &table,
                            values: &row,
                        })
                        .await?;
                    count = count.saturating_add(1);
                }
                printer.emit(&Event::Finished { table: &table, count }).await
            });
        }
        drain(&mut tables).await?;

        let outcome = completion.wait().await;
        let state = *state.borrow();
        self.done(state, outcome).await
    }

    /// Prints a replace run until it ends.
    ///
    /// # Errors
    /// Returns the run's error after its `done` line, or the first output
    /// failure.
    pub async fn replace(&self, handle: ReplaceHandle) -> Result<()> {
        let (mut results, completion) = handle.into_parts();
        let state = completion.subscribe();
        let mut tables = JoinSet::new();

        while let Some(result) = results.recv().await {
            let ReplaceResult {
                table,
                sql,
                start,
                mut affected_rows,
            } = result;
            self.emit(&Event::Table {
                table: &table,
                sql: &sql,
                columns: None,
                start,
            })
            .await?;

            let printer = self.clone();
            tables.spawn(async move {
                let mut total = 0u64;
                while let Some(rows) = affected_rows.recv().await {
                    printer.emit(&Event::Affected { table: &table, rows }).await?;
                    total = total.saturating_add(rows);
                }
                printer
                    .emit(&Event::Finished {
                        table: &table,
                        count: total,
                    })
                    .await
            });
        }
        drain(&mut tables).await?;

        let outcome = completion.wait().await;
        let state = *state.borrow();
        self.done(state, outcome).await
    }

    async fn done(&self, state: RunState, outcome: splace_core::Result<()>) -> Result<()> {
        let error = outcome.as_ref().err().map(ToString::to_string);
        self.emit(&Event::Done { state, error }).await?;
        Ok(outcome?)
    }
}

async fn drain(tables: &mut JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = tables.join_next().await {
        joined.context("Output task failed")??;
    }
    Ok(())
}
