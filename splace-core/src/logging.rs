//! Shared logging setup for the splace binary.

use crate::Result;
use tracing_subscriber::EnvFilter;

/// Maps CLI verbosity flags onto a tracing level.
///
/// `quiet` wins over any verbosity count.
pub const fn level_for(verbose: u8, quiet: bool) -> tracing::Level {
    match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    }
}

/// Initializes structured logging based on verbosity level.
///
/// `RUST_LOG`, when set, overrides the level derived from the flags.
/// With `json` enabled every event is written as one JSON object per line.
///
/// # Example
/// ```rust,no_run
/// use splace_core::logging::init_logging;
///
/// init_logging(1, false, false).expect("Failed to initialize logging");
/// ```
pub fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = level_for(verbose, quiet);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let initialized = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    initialized.map_err(|e| {
        crate::error::SplaceError::configuration(format!("Failed to initialize logging: {e}"))
    })
}
