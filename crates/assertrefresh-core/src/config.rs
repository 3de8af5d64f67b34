//! Configuration for assertion refresh.
//!
//! # Configuration Sources
//!
//! - Environment variables (prefixed with `ASSERTREFRESH_`)
//! - Serialized config (any serde format)
//! - Programmatic defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use assertrefresh_core::config::RefreshConfig;
//!
//! let config = RefreshConfig::builder()
//!     .max_groups(128)
//!     .fallback(false)
//!     .build()?;
//! ```

use crate::error::{RefreshError, Result};
use serde::{Deserialize, Serialize};

/// Default bound on live groups in a resolution pool.
pub const DEFAULT_MAX_GROUPS: usize = 256;

/// Upper bound accepted for `pool.max_groups`.
pub const MAX_GROUPS_LIMIT: usize = 4096;

/// Complete refresh configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Resolution pool configuration.
    pub pool: PoolConfig,

    /// Series that package declarations are looked up under.
    pub series: String,

    /// One-by-one fallback configuration.
    pub fallback: FallbackConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            series: "16".into(),
            fallback: FallbackConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RefreshConfig {
    /// Create a new configuration builder.
    pub fn builder() -> RefreshConfigBuilder {
        RefreshConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// - `ASSERTREFRESH_MAX_GROUPS` - Maximum groups per resolution pool
    /// - `ASSERTREFRESH_SERIES` - Declaration series
    /// - `ASSERTREFRESH_FALLBACK` - Whether to fall back to one-by-one refresh (true/false)
    /// - `ASSERTREFRESH_LOG_LEVEL` - Logging level (trace, debug, info, warn, error)
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Like `from_env`, reading variables through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(max) = var("ASSERTREFRESH_MAX_GROUPS") {
            config.pool.max_groups = max.parse().map_err(|e| {
                RefreshError::Config(format!("Invalid ASSERTREFRESH_MAX_GROUPS: {}", e))
            })?;
        }

        if let Some(series) = var("ASSERTREFRESH_SERIES") {
            config.series = series;
        }

        if let Some(enabled) = var("ASSERTREFRESH_FALLBACK") {
            config.fallback.enabled = enabled.parse().map_err(|e| {
                RefreshError::Config(format!("Invalid ASSERTREFRESH_FALLBACK: {}", e))
            })?;
        }

        if let Some(level) = var("ASSERTREFRESH_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_groups == 0 || self.pool.max_groups > MAX_GROUPS_LIMIT {
            return Err(RefreshError::Config(format!(
                "max_groups must be between 1 and {}",
                MAX_GROUPS_LIMIT
            )));
        }

        if self.series.is_empty() {
            return Err(RefreshError::Config("series must not be empty".into()));
        }

        if self.logging.level.is_empty() {
            return Err(RefreshError::Config("log level must not be empty".into()));
        }

        Ok(())
    }
}

/// Resolution pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of groups a pool tracks before a pass is forced.
    pub max_groups: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_groups: DEFAULT_MAX_GROUPS,
        }
    }
}

/// Fallback configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Retry one assertion at a time when the server rejects bulk refresh.
    pub enabled: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub level: String,

    /// Whether to include the event target in logs.
    pub include_targets: bool,

    /// JSON output format.
    pub json_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            include_targets: true,
            json_output: false,
        }
    }
}

/// Builder for RefreshConfig.
#[derive(Default)]
pub struct RefreshConfigBuilder {
    config: RefreshConfig,
}

impl RefreshConfigBuilder {
    /// Set maximum groups per pool.
    pub fn max_groups(mut self, max: usize) -> Self {
        self.config.pool.max_groups = max;
        self
    }

    /// Set the declaration series.
    pub fn series(mut self, series: impl Into<String>) -> Self {
        self.config.series = series.into();
        self
    }

    /// Enable or disable the one-by-one fallback.
    pub fn fallback(mut self, enabled: bool) -> Self {
        self.config.fallback.enabled = enabled;
        self
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Enable JSON log output.
    pub fn json_logs(mut self, enabled: bool) -> Self {
        self.config.logging.json_output = enabled;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<RefreshConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
