//! Proxy driver: database access tunneled through a remote HTTP script.
//!
//! Every capability is one JSON command POSTed to the script:
//! `{"Cmd", "Query", "Args", "Config", "Secret"}`. The secret is a plain
//! shared value the script compares with its own copy. It keeps casual
//! visitors out of the script; it is not authentication.
//!
//! Query responses are streamed and decoded incrementally by
//! [`protocol::ProxyRows`], so arbitrarily large results never sit in
//! memory on either side.

mod protocol;

use super::{ConnectionConfig, DiscoveredConfig, ProxyOptions, Querier, RowCursor};
use crate::Result;
use crate::error::SplaceError;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::redirect::Policy;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio_util::io::StreamReader;
use zeroize::Zeroizing;

use protocol::ProxyRows;

/// Commands understood by the remote script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Handshake,
    Info,
    Exec,
    Query,
    Dump,
}

impl Command {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Info => "info",
            Self::Exec => "exec",
            Self::Query => "query",
            Self::Dump => "dump",
        }
    }
}

/// Request body of every command.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<'a> {
    cmd: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<&'a str>,
    args: &'a [String],
    config: &'a ConnectionConfig,
    secret: &'a str,
}

/// Reply to `handshake` and `info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyInfo {
    /// Connection settings the script found on its host.
    #[serde(default)]
    pub discovered_configs: Vec<DiscoveredConfig>,
}

/// Querier that forwards every call to a remote proxy script.
pub struct ProxyQuerier {
    client: Client,
    /// Rewritten when the script answers with a redirect.
    url: RwLock<Url>,
    secret: Zeroizing<String>,
    config: ConnectionConfig,
    info: ProxyInfo,
    closed: AtomicBool,
}

impl std::fmt::Debug for ProxyQuerier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyQuerier")
            .field("config", &self.config)
            .field("discovered_configs", &self.info.discovered_configs.len())
            .finish_non_exhaustive()
    }
}

impl ProxyQuerier {
    /// Builds the HTTP client and performs the handshake.
    ///
    /// # Errors
    /// Returns error if the options are invalid, the script is unreachable
    /// or rejects the secret, or the handshake reply is malformed.
    pub async fn connect(config: ConnectionConfig, options: ProxyOptions) -> Result<Self> {
        let url = options.validate()?;
        let client = Client::builder()
            .redirect(Policy::none())
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|e| SplaceError::connection_failed("failed to build HTTP client", e))?;

        let mut querier = Self {
            client,
            url: RwLock::new(url),
            secret: Zeroizing::new(options.secret.clone()),
            config,
            info: ProxyInfo::default(),
            closed: AtomicBool::new(false),
        };

        let response = querier.command(Command::Handshake, None, &[]).await?;
        querier.info = response.json::<ProxyInfo>().await?;

        tracing::info!(
            "Proxy handshake complete for {} ({} discovered configs)",
            querier.config,
            querier.info.discovered_configs.len()
        );
        Ok(querier)
    }

    /// Re-queries the configs the remote script discovers on its host.
    ///
    /// # Errors
    /// Same failure modes as any other command.
    pub async fn fetch_info(&self) -> Result<ProxyInfo> {
        let response = self.command(Command::Info, None, &[]).await?;
        Ok(response.json::<ProxyInfo>().await?)
    }

    /// Current script URL, after any redirect.
    pub async fn url(&self) -> Url {
        self.url.read().await.clone()
    }

    async fn command(
        &self,
        command: Command,
        query: Option<&str>,
        args: &[String],
    ) -> Result<Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SplaceError::configuration("proxy connection is closed"));
        }

        let envelope = Envelope {
            cmd: command.as_str(),
            query,
            args,
            config: &self.config,
            secret: &self.secret,
        };
        let body = Zeroizing::new(
            serde_json::to_vec(&envelope)
                .map_err(|e| SplaceError::serialization("failed to encode proxy command", e))?,
        );

        let mut redirected = false;
        loop {
            let url = self.url.read().await.clone();
            tracing::trace!("Sending '{}' to proxy", command.as_str());
            let response = self
                .client
                .post(url.clone())
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec())
                .send()
                .await?;

            let Some(location) = response.headers().get(LOCATION) else {
                return check_status(response).await;
            };
            if redirected {
                return Err(SplaceError::protocol("proxy redirected more than once"));
            }

            let location = location
                .to_str()
                .map_err(|e| SplaceError::protocol(format!("invalid redirect location: {e}")))?;
            let next = url
                .join(location)
                .map_err(|e| SplaceError::protocol(format!("invalid redirect location: {e}")))?;
            tracing::info!("Proxy moved to {}", next);
            *self.url.write().await = next;
            redirected = true;
        }
    }
}

/// Maps non-success statuses onto the error taxonomy.
///
/// The script reports statement failures as `500` with the engine message
/// as the body.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let body = body.trim();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SplaceError::unauthorized(format!(
            "the proxy rejected the secret ({status}); re-install the remote proxy script"
        ))),
        StatusCode::NOT_FOUND => Err(SplaceError::unauthorized(format!(
            "the proxy script was not found ({status}); re-install the remote proxy script"
        ))),
        StatusCode::INTERNAL_SERVER_ERROR if !body.is_empty() => {
            Err(SplaceError::statement(body.to_string()))
        }
        _ => Err(SplaceError::protocol(format!(
            "proxy responded with {status}: {body}"
        ))),
    }
}

#[async_trait]
impl Querier for ProxyQuerier {
    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn exec(&self, query: &str, args: &[String]) -> Result<u64> {
        let response = self.command(Command::Exec, Some(query), args).await?;
        Ok(response.json::<u64>().await?)
    }

    async fn query(&self, query: &str, args: &[String]) -> Result<Box<dyn RowCursor>> {
        let response = self.command(Command::Query, Some(query), args).await?;
        let body = response.bytes_stream().map_err(std::io::Error::other);
        let reader: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(StreamReader::new(Box::pin(body)));
        Ok(Box::new(ProxyRows::open(reader).await?))
    }

    async fn dump(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let response = self.command(Command::Dump, None, &[]).await?;
        let mut body = response.bytes_stream();
        let mut total = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            total = total.saturating_add(chunk.len());
            sink.write_all(&chunk)
                .await
                .map_err(|e| SplaceError::io("failed to write dump output", e))?;
        }
        sink.flush()
            .await
            .map_err(|e| SplaceError::io("failed to flush dump output", e))?;
        tracing::info!("Dump of {} finished ({} bytes)", self.config, total);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn discovered_configs(&self) -> Vec<DiscoveredConfig> {
        self.info.discovered_configs.clone()
    }

    fn driver_name(&self) -> &'static str {
        "proxy"
    }
}
