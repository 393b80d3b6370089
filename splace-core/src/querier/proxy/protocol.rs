//! Decoder for the proxy's streamed query response.
//!
//! The body is a sequence of independent JSON values, normally one per
//! line, though values may span lines or share one. The first value is the
//! column list. Every following message starts with a tag:
//!
//! - `"R"` then a row (array of values)
//! - `"E"` then an error message; the result ends with that error
//! - `"D"`; the result ends cleanly
//!
//! Decoding is a small state machine so a row is only ever read after its
//! tag, and nothing is read after a terminal message.

use crate::Result;
use crate::error::SplaceError;
use crate::querier::RowCursor;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Reads successive JSON values from a buffered byte stream.
///
/// Whitespace between values, newlines included, is insignificant. Only the
/// value being decoded is held in memory.
pub(crate) struct MessageReader<R> {
    reader: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            eof: false,
        }
    }

    /// Next value decoded as `T`, or `None` at end of stream.
    pub(crate) async fn next<T: DeserializeOwned>(&mut self, what: &str) -> Result<Option<T>> {
        loop {
            let skip = self
                .buf
                .iter()
                .position(|byte| !byte.is_ascii_whitespace())
                .unwrap_or(self.buf.len());
            self.buf.drain(..skip);

            if !self.buf.is_empty() {
                let mut values =
                    serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
                match values.next() {
                    // A number at the very end may continue in the next chunk.
                    Some(Ok(Value::Number(_)))
                        if values.byte_offset() == self.buf.len() && !self.eof => {}
                    Some(Ok(value)) => {
                        let consumed = values.byte_offset();
                        self.buf.drain(..consumed);
                        return serde_json::from_value(value)
                            .map(Some)
                            .map_err(|e| SplaceError::protocol(format!("malformed {what}: {e}")));
                    }
                    Some(Err(e)) if e.is_eof() && !self.eof => {}
                    Some(Err(e)) => {
                        return Err(SplaceError::protocol(format!(
                            "broken stream framing in proxy response: {e}"
                        )));
                    }
                    None => self.buf.clear(),
                }
            }

            if self.eof {
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    /// Appends the next chunk of the body, or marks the end of stream.
    async fn fill(&mut self) -> Result<()> {
        let chunk = self
            .reader
            .fill_buf()
            .await
            .map_err(|e| SplaceError::connection_failed("failed to read proxy response", e))?;
        if chunk.is_empty() {
            self.eof = true;
            return Ok(());
        }
        let read = chunk.len();
        self.buf.extend_from_slice(chunk);
        self.reader.consume(read);
        Ok(())
    }

    /// Like [`MessageReader::next`], but end of stream is a protocol error.
    async fn require<T: DeserializeOwned>(&mut self, what: &str) -> Result<T> {
        self.next(what)
            .await?
            .ok_or_else(|| SplaceError::protocol(format!("proxy response ended before the {what}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    AwaitingTag,
    AwaitingRow,
    AwaitingError,
    Finished,
}

/// Row cursor over a streamed proxy query response.
pub(crate) struct ProxyRows<R> {
    reader: MessageReader<R>,
    columns: Vec<String>,
    row: Vec<String>,
    state: DecoderState,
}

impl<R: AsyncBufRead + Unpin + Send> ProxyRows<R> {
    /// Reads the column list that opens every query response.
    pub(crate) async fn open(reader: R) -> Result<Self> {
        let mut reader = MessageReader::new(reader);
        let columns: Vec<String> = reader.require("column list").await?;
        Ok(Self {
            reader,
            columns,
            row: Vec::new(),
            state: DecoderState::AwaitingTag,
        })
    }

    async fn step(&mut self) -> Result<bool> {
        loop {
            match self.state {
                DecoderState::Finished => return Ok(false),
                DecoderState::AwaitingTag => {
                    let tag: String = self.reader.require("message tag").await?;
                    self.state = match tag.as_str() {
                        "R" => DecoderState::AwaitingRow,
                        "E" => DecoderState::AwaitingError,
                        "D" => DecoderState::Finished,
                        other => {
                            return Err(SplaceError::protocol(format!(
                                "invalid message '{other}' received from proxy"
                            )));
                        }
                    };
                }
                DecoderState::AwaitingRow => {
                    let values: Vec<Value> = self.reader.require("row").await?;
                    if values.len() != self.columns.len() {
                        return Err(SplaceError::protocol(format!(
                            "row has {} values but the result has {} columns",
                            values.len(),
                            self.columns.len()
                        )));
                    }
                    self.row.clear();
                    self.row.extend(values.into_iter().map(cell_text));
                    self.state = DecoderState::AwaitingTag;
                    return Ok(true);
                }
                DecoderState::AwaitingError => {
                    let message: String = self.reader.require("error message").await?;
                    self.state = DecoderState::Finished;
                    return Err(SplaceError::statement(message));
                }
            }
        }
    }
}

/// Renders a row value as text. NULL becomes the empty string.
fn cell_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> RowCursor for ProxyRows<R> {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn advance(&mut self) -> Result<bool> {
        let result = self.step().await;
        if result.is_err() {
            self.state = DecoderState::Finished;
        }
        result
    }

    fn row(&self) -> &[String] {
        &self.row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(body: &'static str) -> (Vec<String>, Vec<Vec<String>>, Result<()>) {
        let mut rows = ProxyRows::open(body.as_bytes()).await.unwrap();
        let columns = rows.columns().to_vec();
        let mut collected = Vec::new();
        let outcome = loop {
            match rows.advance().await {
                Ok(true) => collected.push(rows.row().to_vec()),
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        (columns, collected, outcome)
    }

    #[tokio::test]
    async fn test_rows_then_done() {
        let body = "[\"id\",\"name\"]\n\"R\"\n[\"1\",\"Dvid\"]\n\"R\"\n[\"2\",null]\n\"D\"\n";
        let (columns, rows, outcome) = collect(body).await;

        assert_eq!(columns, vec!["id", "name"]);
        assert_eq!(rows, vec![vec!["1", "Dvid"], vec!["2", ""]]);
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_error_message_ends_result() {
        let body = "[\"id\"]\n\"R\"\n[\"1\"]\n\"E\"\n\"Table 'shop.x' doesn't exist\"\n\"R\"\n[\"2\"]\n";
        let (_, rows, outcome) = collect(body).await;

        assert_eq!(rows, vec![vec!["1"]]);
        match outcome {
            Err(SplaceError::Statement { message }) => {
                assert_eq!(message, "Table 'shop.x' doesn't exist");
            }
            other => panic!("expected statement error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tag_is_protocol_error() {
        let body = "[\"id\"]\n\"X\"\n";
        let (_, _, outcome) = collect(body).await;
        assert!(matches!(outcome, Err(SplaceError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_protocol_error() {
        let body = "[\"id\"]\n\"R\"\n[\"1\"]\n";
        let (_, rows, outcome) = collect(body).await;
        assert_eq!(rows.len(), 1);
        assert!(matches!(outcome, Err(SplaceError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_blank_lines_and_shared_lines() {
        let body = "[\"a\",\"b\"]\n\n\"R\" [\"x\",7]\n\r\n\"D\"";
        let (columns, rows, outcome) = collect(body).await;

        assert_eq!(columns, vec!["a", "b"]);
        assert_eq!(rows, vec![vec!["x", "7"]]);
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_values_spanning_lines() {
        let body = "[\n  \"id\",\n  \"name\"\n]\n\"R\"\n[\n  1,\n  \"Dvid\"\n]\n\"D\"\n";
        let (columns, rows, outcome) = collect(body).await;

        assert_eq!(columns, vec!["id", "name"]);
        assert_eq!(rows, vec![vec!["1", "Dvid"]]);
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_values_split_across_reads() {
        // A one-byte buffer hands the decoder every value in pieces,
        // including a multi-byte character and a trailing number.
        let body = "[\"naïve\",\"n\"]\"R\"[\"café\",12345]\"D\"";
        let reader = tokio::io::BufReader::with_capacity(1, body.as_bytes());
        let mut rows = ProxyRows::open(reader).await.unwrap();

        assert_eq!(rows.columns(), ["naïve", "n"]);
        assert!(rows.advance().await.unwrap());
        assert_eq!(rows.row(), ["café", "12345"]);
        assert!(!rows.advance().await.unwrap());
    }

    #[tokio::test]
    async fn test_bare_number_is_read_whole() {
        let mut reader =
            MessageReader::new(tokio::io::BufReader::with_capacity(1, "12345 6".as_bytes()));
        assert_eq!(reader.next::<u64>("number").await.unwrap(), Some(12345));
        assert_eq!(reader.next::<u64>("number").await.unwrap(), Some(6));
        assert_eq!(reader.next::<u64>("number").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_row_width_mismatch() {
        let body = "[\"a\",\"b\"]\n\"R\"\n[\"only one\"]\n\"D\"\n";
        let (_, rows, outcome) = collect(body).await;
        assert!(rows.is_empty());
        assert!(matches!(outcome, Err(SplaceError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_nothing_is_read_after_terminal_message() {
        let body = "[\"a\"]\n\"D\"\nnot json at all\n";
        let mut rows = ProxyRows::open(body.as_bytes()).await.unwrap();
        assert!(!rows.advance().await.unwrap());
        assert!(!rows.advance().await.unwrap());
    }

    #[tokio::test]
    async fn test_broken_framing() {
        let body = "[\"a\"]\n\"R\"\n[\"unterminated\n";
        let (_, _, outcome) = collect(body).await;
        assert!(matches!(outcome, Err(SplaceError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_missing_column_list() {
        let result = ProxyRows::open("".as_bytes()).await;
        assert!(matches!(result, Err(SplaceError::Protocol { .. })));
    }
}
