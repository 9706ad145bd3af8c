//! Broadcaster configuration.
//!
//! Configuration can be built in code, parsed from TOML, or loaded from a
//! file. The default delivery timeout can be overridden with the
//! `STROBE_DELIVERY_TIMEOUT_MS` environment variable.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the default delivery timeout.
pub const DELIVERY_TIMEOUT_ENV: &str = "STROBE_DELIVERY_TIMEOUT_MS";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The config contents are not valid TOML for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How long a single delivery attempt may wait on a full subscriber channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Give up on one subscriber after `timeout_ms` and log a diagnostic.
    Bounded {
        #[serde(default = "default_delivery_timeout_ms")]
        timeout_ms: u64,
    },
    /// Wait until the subscriber reads or its subscription closes.
    ///
    /// A consumer that never reads and never closes parks one delivery task
    /// per pulse for as long as it stays subscribed.
    Unbounded,
}

impl DeliveryPolicy {
    /// Bounded policy with the given timeout.
    #[must_use]
    pub fn bounded(timeout: Duration) -> Self {
        Self::Bounded {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The timeout, or `None` for the unbounded policy.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Bounded { timeout_ms } => Some(Duration::from_millis(*timeout_ms)),
            Self::Unbounded => None,
        }
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::Bounded {
            timeout_ms: default_delivery_timeout_ms(),
        }
    }
}

/// Broadcaster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    /// Per-subscriber channel capacity (clamped to at least 1).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Delivery policy for subscribers that are not keeping up.
    #[serde(default)]
    pub delivery: DeliveryPolicy,
}

// Default value functions
fn default_channel_capacity() -> usize {
    1
}

fn default_delivery_timeout_ms() -> u64 {
    std::env::var(DELIVERY_TIMEOUT_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1_000)
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            delivery: DeliveryPolicy::default(),
        }
    }
}

impl BroadcasterConfig {
    /// Set the per-subscriber channel capacity.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the delivery policy.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryPolicy) -> Self {
        self.delivery = delivery;
        self
    }

    /// Channel capacity actually used when creating subscriptions.
    #[must_use]
    pub fn effective_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid TOML for this schema.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }
}
