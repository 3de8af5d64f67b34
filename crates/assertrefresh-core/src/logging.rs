//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; hosts that do not install their
//! own subscriber can call `init_tracing` once at startup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{RefreshError, Result};

/// Filter for `config.level`. Accepts a bare level or full directives.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_new(&config.level)
        .map_err(|e| RefreshError::Logging(format!("invalid log level {:?}: {}", config.level, e)))
}

/// Install a global `fmt` subscriber configured from `config`.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let installed = if config.json_output {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| RefreshError::Logging(e.to_string()))
}
