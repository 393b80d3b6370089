//! Tuning for the search and replace engines.

use crate::Result;
use crate::error::SplaceError;
use serde::{Deserialize, Serialize};

/// Engine configuration shared by every run of a session.
///
/// # Example
/// ```rust
/// use splace_core::EngineConfig;
///
/// let config = EngineConfig::default().with_workers(4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tables scanned concurrently by a search
    pub workers: usize,
    /// Rows buffered per table before the scanning worker waits
    pub row_buffer: usize,
    /// Table headers buffered before new tables wait for the consumer
    pub result_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            row_buffer: 256,
            result_buffer: 16,
        }
    }
}

impl EngineConfig {
    /// Builder method to set the search worker count.
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Builder method to set the per-table row buffer.
    pub const fn with_row_buffer(mut self, row_buffer: usize) -> Self {
        self.row_buffer = row_buffer;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a configuration error when the worker count is outside
    /// `1..=64` or a buffer size is zero.
    pub fn validate(&self) -> Result<()> {
        if !(1..=64).contains(&self.workers) {
            return Err(SplaceError::configuration(format!(
                "workers must be between 1 and 64, got {}",
                self.workers
            )));
        }
        if self.row_buffer == 0 {
            return Err(SplaceError::configuration("row_buffer must be greater than 0"));
        }
        if self.result_buffer == 0 {
            return Err(SplaceError::configuration(
                "result_buffer must be greater than 0",
            ));
        }
        Ok(())
    }
}
