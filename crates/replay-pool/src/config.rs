//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;
use crate::owner::OwnerId;

/// How callers without a checkout of their own are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Callers must check out explicitly.
    #[default]
    Manual,
    /// Callers without a connection check one out on first use.
    Auto,
    /// Every caller uses this owner's connection.
    Shared(OwnerId),
}

/// Configuration for an ownership pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections (default: 10).
    pub max_connections: u32,

    /// How long a checkout waits for a free connection (default: 30s).
    pub connection_timeout: Duration,

    /// How long an owner may hold a connection before it is reclaimed
    /// (default: 120s).
    pub ownership_timeout: Duration,

    /// Initial ownership mode (default: manual).
    pub mode: Mode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connection_timeout: Duration::from_secs(30),
            ownership_timeout: Duration::from_secs(120),
            mode: Mode::Manual,
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value;` pairs into a configuration.
    ///
    /// ```text
    /// Pool Size=4;Checkout Timeout=5000;Ownership Timeout=60000;Mode=auto;
    /// ```
    ///
    /// Timeouts are in milliseconds. Unknown keys are ignored.
    pub fn from_options_string(options: &str) -> Result<Self, PoolError> {
        let mut config = Self::default();

        for part in options.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "pool size" | "max connections" | "pool_size" => {
                    config.max_connections = value
                        .parse()
                        .map_err(|_| PoolError::Config(format!("invalid pool size: {value}")))?;
                }
                "checkout timeout" | "connection timeout" | "queue_target" => {
                    config.connection_timeout = parse_millis(value)?;
                }
                "ownership timeout" | "ownership_timeout" => {
                    config.ownership_timeout = parse_millis(value)?;
                }
                "mode" => {
                    config.mode = match value.to_lowercase().as_str() {
                        "auto" => Mode::Auto,
                        "manual" => Mode::Manual,
                        other => {
                            return Err(PoolError::Config(format!(
                                "invalid mode: {other} (expected auto or manual)"
                            )));
                        }
                    };
                }
                _ => {
                    tracing::debug!(key = key, value = value, "ignoring unknown pool option");
                }
            }
        }

        Ok(config)
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the checkout wait timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the ownership timeout.
    #[must_use]
    pub fn ownership_timeout(mut self, timeout: Duration) -> Self {
        self.ownership_timeout = timeout;
        self
    }

    /// Set the initial mode.
    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Check the configuration for invalid values.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Config(
                "max_connections must be greater than zero".into(),
            ));
        }
        if self.ownership_timeout.is_zero() {
            return Err(PoolError::Config(
                "ownership_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_millis(value: &str) -> Result<Duration, PoolError> {
    value
        .parse()
        .map(Duration::from_millis)
        .map_err(|_| PoolError::Config(format!("invalid timeout: {value}")))
}
