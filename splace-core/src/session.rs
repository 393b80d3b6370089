//! A connected session: one querier plus its discovered schema.

use crate::Result;
use crate::config::EngineConfig;
use crate::error::SplaceError;
use crate::models::{TableMap, TableSelection};
use crate::querier::{DriverConfig, Querier};
use crate::replace::{self, ReplaceHandle, ReplaceOptions};
use crate::schema;
use crate::search::{self, SearchHandle, SearchOptions};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// Binds a [`Querier`] to the [`TableMap`] discovered when connecting.
///
/// The schema is a snapshot; later schema changes are not picked up.
///
/// # Example
/// ```rust,no_run
/// use splace_core::{
///     ConnectionConfig, DirectOptions, DriverConfig, Engine, EngineConfig, MatchMode,
///     SearchOptions, Splace, select_all,
/// };
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> splace_core::Result<()> {
/// let config = ConnectionConfig::new(Engine::MySql, "localhost:3306")
///     .with_user("root")
///     .with_database("shop");
/// let splace = Splace::open(
///     DriverConfig::Direct { config, options: DirectOptions::default() },
///     EngineConfig::default(),
/// )
/// .await?;
///
/// let options = SearchOptions {
///     search: "Dvid".to_string(),
///     mode: MatchMode::Equals,
///     tables: select_all(splace.tables()),
///     limit: 1000,
/// };
/// let mut handle = splace.search(options, &CancellationToken::new())?;
/// while let Some(mut result) = handle.next_result().await {
///     while let Some(row) = result.rows.recv().await {
///         println!("{}: {:?}", result.table, row);
///     }
/// }
/// handle.completion.wait().await?;
/// # Ok(())
/// # }
/// ```
pub struct Splace {
    querier: Arc<dyn Querier>,
    tables: TableMap,
    config: EngineConfig,
}

impl std::fmt::Debug for Splace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Splace")
            .field("connection", &self.querier.config().to_string())
            .field("driver", &self.querier.driver_name())
            .field("tables", &self.tables.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Splace {
    /// Creates the driver and connects a session to it.
    ///
    /// # Errors
    /// Returns the driver construction error or the discovery error.
    pub async fn open(driver: DriverConfig, config: EngineConfig) -> Result<Self> {
        let querier = crate::querier::connect(driver).await?;
        Self::connect(querier, config).await
    }

    /// Connects a session to an existing querier by discovering its schema.
    ///
    /// # Errors
    /// Fails when the engine config is invalid or the catalog cannot be
    /// read. The querier is left open either way.
    pub async fn connect(querier: Arc<dyn Querier>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let tables = schema::discover(querier.as_ref()).await.map_err(|e| {
            tracing::error!("Schema discovery failed for {}: {}", querier.config(), e);
            e
        })?;
        Ok(Self {
            querier,
            tables,
            config,
        })
    }

    /// The discovered schema.
    pub const fn tables(&self) -> &TableMap {
        &self.tables
    }

    /// The underlying querier.
    pub fn querier(&self) -> &Arc<dyn Querier> {
        &self.querier
    }

    /// Starts a search over the selected tables.
    ///
    /// # Errors
    /// Returns a configuration error when the selection names a table or
    /// column that was not discovered.
    pub fn search(&self, options: SearchOptions, cancel: &CancellationToken) -> Result<SearchHandle> {
        self.check_selection(&options.tables)?;
        search::start(Arc::clone(&self.querier), options, self.config, cancel)
    }

    /// Starts a replace over the selected tables.
    ///
    /// # Errors
    /// Returns a configuration error for an unknown table or column, an
    /// unsupported mode, or a replace that would never drain.
    pub fn replace(
        &self,
        options: ReplaceOptions,
        cancel: &CancellationToken,
    ) -> Result<ReplaceHandle> {
        self.check_selection(&options.tables)?;
        replace::start(
            Arc::clone(&self.querier),
            &self.tables,
            options,
            self.config,
            cancel,
        )
    }

    /// Streams a full backup of the database into `sink`.
    ///
    /// # Errors
    /// Returns the driver's dump failure.
    pub async fn dump(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        self.querier.dump(sink).await
    }

    /// Closes the underlying querier.
    ///
    /// # Errors
    /// Returns the driver's close failure.
    pub async fn close(&self) -> Result<()> {
        self.querier.close().await
    }

    fn check_selection(&self, selection: &TableSelection) -> Result<()> {
        for (table, columns) in selection {
            let known = self.tables.get(table).ok_or_else(|| {
                SplaceError::configuration(format!("unknown table '{table}'"))
            })?;
            if let Some(column) = columns
                .iter()
                .find(|column| !known.iter().any(|info| &info.name == *column))
            {
                return Err(SplaceError::configuration(format!(
                    "unknown column '{column}' in table '{table}'"
                )));
            }
        }
        Ok(())
    }
}
