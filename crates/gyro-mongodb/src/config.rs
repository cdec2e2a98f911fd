//! Client configuration

use bson::{Bson, Document};
use gyro_common::GyroError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;

/// Address used when none is configured
pub const DEFAULT_ADDRESS: &str = "mongodb://localhost:27017";

/// Delay between reconnection attempts when none is configured
pub const DEFAULT_RECONNECT_TIMEOUT_MS: u64 = 500;

/// Option key carrying the reconnection delay in milliseconds
pub const RECONNECT_TIMEOUT_KEY: &str = "reconnectTimeout";

/// Environment variable overriding the address
pub const ENV_ADDRESS: &str = "GYRO_MONGODB_URL";

/// Environment variable overriding the reconnection delay (milliseconds)
pub const ENV_RECONNECT_TIMEOUT: &str = "GYRO_RECONNECT_TIMEOUT_MS";

/// Configuration for a [`Mongo`](crate::Mongo) client
///
/// Every option other than `reconnectTimeout` is kept in `driver_options` and
/// handed to the driver's connect call unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Connection string of the deployment
    pub address: String,
    /// Milliseconds to wait before retrying a failed connection
    #[serde(rename = "reconnectTimeout")]
    pub reconnect_timeout_ms: u64,
    /// Options passed through to the driver
    #[serde(flatten)]
    pub driver_options: Document,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            reconnect_timeout_ms: DEFAULT_RECONNECT_TIMEOUT_MS,
            driver_options: Document::new(),
        }
    }
}

impl ClientConfig {
    /// Configuration for `address` with default options
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Build a configuration from an options document
    ///
    /// `reconnectTimeout` is extracted; everything else becomes a driver option.
    pub fn from_options(address: impl Into<String>, mut options: Document) -> Result<Self> {
        let mut config = Self::new(address);
        if let Some(timeout) = options.remove(RECONNECT_TIMEOUT_KEY) {
            config.reconnect_timeout_ms = millis(&timeout)?;
        }
        config.driver_options = options;
        Ok(config)
    }

    /// Defaults overridden by `GYRO_MONGODB_URL` and `GYRO_RECONNECT_TIMEOUT_MS`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(address) = std::env::var(ENV_ADDRESS) {
            config.address = address;
        }
        if let Ok(raw) = std::env::var(ENV_RECONNECT_TIMEOUT) {
            config.reconnect_timeout_ms = raw.trim().parse().map_err(|e| {
                GyroError::Config(format!("{} must be a number of milliseconds: {}", ENV_RECONNECT_TIMEOUT, e))
            })?;
        }
        Ok(config)
    }

    /// Set the reconnection delay
    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Add a driver option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.driver_options.insert(key.into(), value.into());
        self
    }

    /// Delay between reconnection attempts
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }
}

fn millis(value: &Bson) -> Result<u64> {
    let ms = match value {
        Bson::Int32(v) => i64::from(*v),
        Bson::Int64(v) => *v,
        Bson::Double(v) if v.fract() == 0.0 => *v as i64,
        other => {
            return Err(GyroError::Config(format!(
                "{} must be an integer number of milliseconds, got {}",
                RECONNECT_TIMEOUT_KEY, other
            )))
        }
    };
    u64::try_from(ms).map_err(|_| GyroError::Config(format!("{} must not be negative", RECONNECT_TIMEOUT_KEY)))
}
