//! Database access abstraction and its two drivers.
//!
//! Every backend implements [`Querier`]: execute a statement, run a query
//! returning a [`RowCursor`], stream a full dump, and close. The driver is
//! chosen at connect time from a [`DriverConfig`].
//!
//! # Module Structure
//! - `config`: connection and per-driver options
//! - `direct`: native MySQL connection pool (sqlx)
//! - `dump`: external dump utility used by the direct driver
//! - `proxy`: JSON commands tunneled over HTTP to a remote script

use crate::Result;
use crate::error::SplaceError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncWrite;

pub mod config;

#[cfg(feature = "direct")]
pub mod direct;
#[cfg(feature = "direct")]
mod dump;
#[cfg(feature = "proxy")]
pub mod proxy;

pub use config::{ConnectionConfig, DirectOptions, DiscoveredConfig, ProxyOptions};

/// Forward-only cursor over a query result.
///
/// Every value is rendered as a string regardless of its column type.
/// The row buffer is reused between advances, so callers that keep a row
/// must copy it (`cursor.row().to_vec()`).
#[async_trait]
pub trait RowCursor: Send {
    /// Column names in result order.
    fn columns(&self) -> &[String];

    /// Moves to the next row.
    ///
    /// Returns `Ok(false)` once the result is exhausted; further calls keep
    /// returning `Ok(false)`.
    ///
    /// # Errors
    /// Returns the transport, statement or protocol error that ended the
    /// result early.
    async fn advance(&mut self) -> Result<bool>;

    /// Values of the current row, aligned with [`RowCursor::columns`].
    ///
    /// Empty before the first successful advance.
    fn row(&self) -> &[String];
}

/// Capability set shared by every database backend.
///
/// # Object Safety
/// This trait is object-safe; drivers are handed around as
/// `Arc<dyn Querier>` and shared by concurrent search workers.
#[async_trait]
pub trait Querier: Send + Sync {
    /// The configuration the driver was constructed from. No I/O.
    fn config(&self) -> &ConnectionConfig;

    /// Executes a mutating statement and returns the affected row count.
    ///
    /// # Errors
    /// Transport errors on connectivity loss; statement errors when the
    /// engine rejects the SQL.
    async fn exec(&self, query: &str, args: &[String]) -> Result<u64>;

    /// Runs a read statement.
    ///
    /// # Errors
    /// Fails before any row is read when the statement cannot be started;
    /// later failures surface through [`RowCursor::advance`].
    async fn query(&self, query: &str, args: &[String]) -> Result<Box<dyn RowCursor>>;

    /// Streams a full logical backup of the database into `sink`.
    ///
    /// # Errors
    /// Returns `UnsupportedFeature` for engines the driver cannot dump, or
    /// the failure of the dump itself.
    async fn dump(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()>;

    /// Releases held resources. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Connection configs discovered by the backend on its host.
    fn discovered_configs(&self) -> Vec<DiscoveredConfig> {
        Vec::new()
    }

    /// Short driver name for logs and CLI output.
    fn driver_name(&self) -> &'static str;
}

/// Driver selection, made once at connect time.
#[derive(Debug, Clone)]
pub enum DriverConfig {
    /// Native network connection to the database.
    Direct {
        config: ConnectionConfig,
        options: DirectOptions,
    },
    /// HTTP tunnel through a remote proxy script.
    Proxy {
        config: ConnectionConfig,
        options: ProxyOptions,
    },
}

impl DriverConfig {
    /// The connection config shared by both variants.
    pub const fn connection(&self) -> &ConnectionConfig {
        match self {
            Self::Direct { config, .. } | Self::Proxy { config, .. } => config,
        }
    }
}

/// Factory function creating a querier for the selected driver.
///
/// # Errors
/// Returns error if:
/// - The engine is not supported
/// - The configuration is invalid
/// - The driver was not compiled in
/// - The proxy handshake fails
pub async fn connect(driver: DriverConfig) -> Result<Arc<dyn Querier>> {
    let engine = driver.connection().engine;
    if !engine.is_supported() {
        return Err(SplaceError::unsupported_engine(engine));
    }
    driver.connection().validate()?;

    match driver {
        #[cfg(feature = "direct")]
        DriverConfig::Direct { config, options } => {
            let querier = direct::DirectQuerier::new(config, options)?;
            Ok(Arc::new(querier))
        }
        #[cfg(not(feature = "direct"))]
        DriverConfig::Direct { .. } => Err(SplaceError::unsupported_feature(
            "Direct driver",
            "Compile with --features direct to enable native connections",
        )),
        #[cfg(feature = "proxy")]
        DriverConfig::Proxy { config, options } => {
            let querier = proxy::ProxyQuerier::connect(config, options).await?;
            Ok(Arc::new(querier))
        }
        #[cfg(not(feature = "proxy"))]
        DriverConfig::Proxy { .. } => Err(SplaceError::unsupported_feature(
            "Proxy driver",
            "Compile with --features proxy to enable the HTTP proxy",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Engine;

    #[tokio::test]
    async fn test_connect_rejects_unsupported_engine() {
        let config = ConnectionConfig::new(Engine::PostgreSql, "localhost:5432").with_database("x");
        let result = connect(DriverConfig::Direct {
            config,
            options: DirectOptions::default(),
        })
        .await;
        assert!(matches!(result, Err(SplaceError::UnsupportedEngine { .. })));
    }

    #[tokio::test]
    async fn test_connect_validates_config() {
        let config = ConnectionConfig::new(Engine::MySql, "localhost:3306");
        let result = connect(DriverConfig::Proxy {
            config,
            options: ProxyOptions::new("http://127.0.0.1:9/proxy.php", "s"),
        })
        .await;
        assert!(matches!(result, Err(SplaceError::Configuration { .. })));
    }

    #[test]
    fn test_driver_config_connection() {
        let config = ConnectionConfig::new(Engine::MySql, "db:3306").with_database("shop");
        let driver = DriverConfig::Direct {
            config: config.clone(),
            options: DirectOptions::default(),
        };
        assert_eq!(driver.connection(), &config);
    }
}
