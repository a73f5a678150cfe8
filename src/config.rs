//! Runtime configuration
//!
//! Defaults live in [`CourierConfig::default`]. With the `config-file`
//! feature an optional TOML/JSON file and `COURIER_*` environment variables
//! are layered on top, in that order.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::idempotency::DEFAULT_TIMEOUT_SECS;

/// Prefix of the environment variables read by [`CourierConfig::load`]
pub const ENV_PREFIX: &str = "COURIER";

/// Courier settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Base URL of the v4 HTTP API
    pub endpoint: String,
    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,
    /// Pause between polls in milliseconds
    pub poll_interval_ms: u64,
    /// Validity window of highload transfers in seconds
    pub transfer_timeout_secs: u32,
    /// Wall-clock bound for one delivery; `0` waits forever
    pub send_timeout_secs: u64,
    /// Workchain wallets live in; derived addresses use it and given ones
    /// must match it
    pub workchain: i8,
    /// Sub-wallet id; each wallet kind has its own default
    pub wallet_id: Option<u32>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://mainnet-v4.tonhubapi.com".to_string(),
            request_timeout_secs: 10,
            poll_interval_ms: 1000,
            transfer_timeout_secs: DEFAULT_TIMEOUT_SECS,
            send_timeout_secs: 120,
            workchain: 0,
            wallet_id: None,
        }
    }
}

impl CourierConfig {
    /// Pause between two polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Timeout applied to each HTTP request
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `None` when deliveries are unbounded
    pub fn send_timeout(&self) -> Option<Duration> {
        (self.send_timeout_secs > 0).then(|| Duration::from_secs(self.send_timeout_secs))
    }

    /// Load defaults, then `path` if given and present, then the environment
    #[cfg(feature = "config-file")]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&CourierConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize::<CourierConfig>()?;
        config.validate()?;

        tracing::debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Without the `config-file` feature only the defaults are available
    #[cfg(not(feature = "config-file"))]
    pub fn load(_path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = CourierConfig::default();
        config.validate()?;
        Ok(config)
    }

    /// Reject values the delivery loops cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if !matches!(self.workchain, -1 | 0) {
            return Err(ConfigError::Invalid(format!(
                "unsupported workchain {}",
                self.workchain
            )));
        }
        Ok(())
    }

    /// Reject a wallet address outside the configured workchain
    pub fn check_address(&self, address: &Address) -> Result<(), ConfigError> {
        if address.workchain != self.workchain {
            return Err(ConfigError::Invalid(format!(
                "{} is not in workchain {}",
                address, self.workchain
            )));
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Source(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(feature = "config-file")]
impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Source(err.to_string())
    }
}
