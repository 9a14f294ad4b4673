//! Tracing subscriber setup for binaries and demos.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the application. `RUST_LOG` always wins over the configured level.

use crate::{BacklotError, Result, config::LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG`, falling back to `config.level`.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| {
        BacklotError::Config(format!("invalid log level '{}': {}", config.level, e))
    })
}

/// Installs the global subscriber. Fails if one is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_target);

    let result = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| BacklotError::Config(format!("failed to initialize logging: {}", e)))
}
