//! Direct driver: a pooled native MySQL connection.
//!
//! # Security Features
//! - The connection string is only ever logged in redacted form
//! - The dump utility receives the password through its environment, not
//!   its argument list
//!
//! Query results are read by a background task that forwards rows through
//! a bounded channel, so a slow consumer pauses the read instead of
//! buffering the whole result set.

use super::{ConnectionConfig, DirectOptions, Querier, RowCursor};
use crate::Result;
use crate::error::{SplaceError, redact_database_url};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Executor, Row, Statement, TypeInfo};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};

/// Rows read ahead of the consumer per open cursor.
const ROW_PREFETCH: usize = 64;

/// MySQL querier backed by a sqlx connection pool.
pub struct DirectQuerier {
    pool: MySqlPool,
    config: ConnectionConfig,
    options: DirectOptions,
}

impl std::fmt::Debug for DirectQuerier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectQuerier")
            .field("config", &self.config)
            .field("pool_size", &self.pool.size())
            .field("pool_idle", &self.pool.num_idle())
            .finish_non_exhaustive()
    }
}

impl DirectQuerier {
    /// Creates the driver with a lazily connecting pool.
    ///
    /// No connection is opened here; the first statement does that.
    ///
    /// # Errors
    /// Returns error if the config or options are invalid, or the engine
    /// has no direct implementation.
    pub fn new(config: ConnectionConfig, options: DirectOptions) -> Result<Self> {
        config.validate()?;
        options.validate()?;
        let dsn = config.to_dsn()?;

        let pool = MySqlPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.connect_timeout)
            .test_before_acquire(true)
            .connect_lazy(&dsn)
            .map_err(|e| {
                SplaceError::connection_failed(
                    format!(
                        "Failed to create MySQL connection pool to {}",
                        redact_database_url(&dsn)
                    ),
                    e,
                )
            })?;

        tracing::debug!("Created MySQL connection pool for {}", config);
        Ok(Self {
            pool,
            config,
            options,
        })
    }
}

#[async_trait]
impl Querier for DirectQuerier {
    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn exec(&self, query: &str, args: &[String]) -> Result<u64> {
        let mut statement = sqlx::query(query);
        for arg in args {
            statement = statement.bind(arg.as_str());
        }
        let result = statement.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, query: &str, args: &[String]) -> Result<Box<dyn RowCursor>> {
        let (header_tx, header_rx) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::channel(ROW_PREFETCH);

        tokio::spawn(stream_rows(
            self.pool.clone(),
            query.to_string(),
            args.to_vec(),
            header_tx,
            rows_tx,
        ));

        let columns = header_rx
            .await
            .map_err(|_| SplaceError::protocol("query task ended before reporting columns"))??;

        Ok(Box::new(DirectRows {
            columns,
            rows: rows_rx,
            current: Vec::new(),
            finished: false,
        }))
    }

    async fn dump(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        super::dump::mysqldump(&self.options, &self.config, sink).await
    }

    async fn close(&self) -> Result<()> {
        if !self.pool.is_closed() {
            tracing::debug!("Closing MySQL connection pool for {}", self.config);
            self.pool.close().await;
        }
        Ok(())
    }

    fn driver_name(&self) -> &'static str {
        "direct"
    }
}

/// Reads one result set on a dedicated connection.
///
/// Column names come from preparing the statement, so they are known even
/// when no row matches. Errors before the header go to `header`, later
/// ones travel with the rows. A dropped cursor ends the read.
async fn stream_rows(
    pool: MySqlPool,
    sql: String,
    args: Vec<String>,
    header: oneshot::Sender<Result<Vec<String>>>,
    rows: mpsc::Sender<Result<Vec<String>>>,
) {
    let mut conn = match pool.acquire().await {
        Ok(conn) => conn,
        Err(e) => {
            let _ = header.send(Err(e.into()));
            return;
        }
    };

    let statement = match (&mut *conn).prepare(sql.as_str()).await {
        Ok(statement) => statement,
        Err(e) => {
            let _ = header.send(Err(e.into()));
            return;
        }
    };

    let columns = statement
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect();
    if header.send(Ok(columns)).is_err() {
        return;
    }

    // Unbound statements go over the text protocol, where the server
    // renders every value itself. Bound ones need the binary protocol.
    let format = if args.is_empty() {
        CellFormat::Text
    } else {
        CellFormat::Binary
    };
    let mut stream = match format {
        CellFormat::Text => (&mut *conn).fetch(sql.as_str()),
        CellFormat::Binary => {
            let mut query = statement.query();
            for arg in &args {
                query = query.bind(arg.as_str());
            }
            query.fetch(&mut *conn)
        }
    };

    loop {
        let item = match stream.try_next().await {
            Ok(Some(row)) => row_to_strings(&row, format),
            Ok(None) => break,
            Err(e) => Err(e.into()),
        };
        let failed = item.is_err();
        if rows.send(item).await.is_err() || failed {
            break;
        }
    }
}

struct DirectRows {
    columns: Vec<String>,
    rows: mpsc::Receiver<Result<Vec<String>>>,
    current: Vec<String>,
    finished: bool,
}

#[async_trait]
impl RowCursor for DirectRows {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn advance(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }
        match self.rows.recv().await {
            Some(Ok(row)) => {
                self.current = row;
                Ok(true)
            }
            Some(Err(e)) => {
                self.finished = true;
                Err(e)
            }
            None => {
                self.finished = true;
                Ok(false)
            }
        }
    }

    fn row(&self) -> &[String] {
        &self.current
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellFormat {
    Text,
    Binary,
}

fn row_to_strings(row: &MySqlRow, format: CellFormat) -> Result<Vec<String>> {
    (0..row.len())
        .map(|index| match format {
            CellFormat::Text => text_cell(row, index),
            CellFormat::Binary => binary_cell(row, index),
        })
        .collect()
}

/// Renders a text protocol cell. NULL becomes the empty string.
fn text_cell(row: &MySqlRow, index: usize) -> Result<String> {
    Ok(raw(row, index)?
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_default())
}

/// Renders a binary protocol cell the way the server prints it in text.
///
/// Temporal values are formatted from their wire layout, so zero dates and
/// out-of-day `TIME` values survive.
fn binary_cell(row: &MySqlRow, index: usize) -> Result<String> {
    let type_name = row.column(index).type_info().name();

    let value = match type_name {
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            decode::<i64>(row, index)?.map(|v| v.to_string())
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" | "YEAR" => decode::<u64>(row, index)?.map(|v| v.to_string()),
        "FLOAT" => decode::<f32>(row, index)?.map(|v| v.to_string()),
        "DOUBLE" => decode::<f64>(row, index)?.map(|v| v.to_string()),
        "DATE" => raw(row, index)?.map(|buf| binary_datetime(buf, false)).transpose()?,
        "DATETIME" | "TIMESTAMP" => raw(row, index)?
            .map(|buf| binary_datetime(buf, true))
            .transpose()?,
        "TIME" => raw(row, index)?.map(binary_time).transpose()?,
        _ => raw(row, index)?.map(|bytes| String::from_utf8_lossy(bytes).into_owned()),
    };

    Ok(value.unwrap_or_default())
}

fn raw(row: &MySqlRow, index: usize) -> Result<Option<&[u8]>> {
    decode::<&[u8]>(row, index)
}

fn decode<'r, T>(row: &'r MySqlRow, index: usize) -> Result<Option<T>>
where
    T: sqlx::Decode<'r, MySql>,
{
    row.try_get_unchecked::<Option<T>, _>(index)
        .map_err(SplaceError::from)
}

/// Formats a binary `DATE`/`DATETIME`/`TIMESTAMP` value.
///
/// `buf` starts with the length byte; a length of 0 is the zero date.
fn binary_datetime(buf: &[u8], with_time: bool) -> Result<String> {
    let (&len, body) = buf
        .split_first()
        .ok_or_else(|| SplaceError::protocol("empty temporal value"))?;
    let body = body
        .get(..usize::from(len))
        .ok_or_else(|| SplaceError::protocol(format!("truncated temporal value of {len} bytes")))?;

    let mut date = [0u8; 11];
    match len {
        0 | 4 | 7 | 11 => date[..body.len()].copy_from_slice(body),
        _ => {
            return Err(SplaceError::protocol(format!(
                "unexpected temporal value length {len}"
            )));
        }
    }

    let year = u16::from_le_bytes([date[0], date[1]]);
    let mut text = format!("{year:04}-{:02}-{:02}", date[2], date[3]);
    if with_time {
        text.push_str(&format!(" {:02}:{:02}:{:02}", date[4], date[5], date[6]));
        let micros = u32::from_le_bytes([date[7], date[8], date[9], date[10]]);
        push_micros(&mut text, micros);
    }
    Ok(text)
}

/// Formats a binary `TIME` value, which may be negative or exceed a day.
fn binary_time(buf: &[u8]) -> Result<String> {
    let (&len, body) = buf
        .split_first()
        .ok_or_else(|| SplaceError::protocol("empty time value"))?;
    let body = body
        .get(..usize::from(len))
        .ok_or_else(|| SplaceError::protocol(format!("truncated time value of {len} bytes")))?;

    let mut time = [0u8; 12];
    match len {
        0 | 8 | 12 => time[..body.len()].copy_from_slice(body),
        _ => {
            return Err(SplaceError::protocol(format!(
                "unexpected time value length {len}"
            )));
        }
    }

    let sign = if time[0] == 1 { "-" } else { "" };
    let days = u64::from(u32::from_le_bytes([time[1], time[2], time[3], time[4]]));
    let hours = days.saturating_mul(24).saturating_add(u64::from(time[5]));
    let mut text = format!("{sign}{hours:02}:{:02}:{:02}", time[6], time[7]);
    push_micros(&mut text, u32::from_le_bytes([time[8], time[9], time[10], time[11]]));
    Ok(text)
}

/// Appends fractional seconds without trailing zeros.
fn push_micros(text: &mut String, micros: u32) {
    if micros != 0 {
        let digits = format!("{micros:06}");
        text.push('.');
        text.push_str(digits.trim_end_matches('0'));
    }
}
