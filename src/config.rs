//! Controller configuration
//!
//! Every field has a default so a config file only needs to name what it
//! changes. Durations are written in milliseconds.
//!
//! ```yaml
//! workers: 8
//! callTimeoutMs: 5000
//! pollIntervalMs: 60000
//! backoff:
//!   initialDelayMs: 1000
//!   maxDelayMs: 300000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::retry::RetryConfig;
use crate::Error;

/// Tunables for the reconciliation controller and its worker pool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Number of resources reconciled concurrently
    pub workers: usize,

    /// Deadline applied to every external system call
    #[serde(with = "millis", rename = "callTimeoutMs")]
    pub call_timeout: Duration,

    /// Requeue interval for resources that are in sync, to detect drift
    #[serde(with = "millis", rename = "pollIntervalMs")]
    pub poll_interval: Duration,

    /// Requeue interval after a create, update or delete, to re-observe
    #[serde(with = "millis", rename = "shortRequeueMs")]
    pub short_requeue: Duration,

    /// Requeue interval for resources stuck on a terminal error
    #[serde(with = "millis", rename = "terminalRequeueMs")]
    pub terminal_requeue: Duration,

    /// Requeue backoff for transient errors, keyed on consecutive failures
    #[serde(deserialize_with = "backoff_over_defaults")]
    pub backoff: RetryConfig,

    /// In-place retries of a single transient attribute update
    #[serde(deserialize_with = "apply_retry_over_defaults")]
    pub apply_retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            call_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(60),
            short_requeue: Duration::from_secs(1),
            terminal_requeue: Duration::from_secs(120),
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                backoff_multiplier: 2.0,
            },
            apply_retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                backoff_multiplier: 2.0,
            },
        }
    }
}

impl ControllerConfig {
    /// Parse a config from YAML, filling unspecified fields with defaults
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid controller config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&yaml)
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.call_timeout.is_zero() {
            return Err(Error::config("callTimeoutMs must be positive"));
        }
        if self.terminal_requeue < self.short_requeue {
            return Err(Error::config(
                "terminalRequeueMs must not be shorter than shortRequeueMs",
            ));
        }
        for (name, retry) in [("backoff", &self.backoff), ("applyRetry", &self.apply_retry)] {
            if retry.backoff_multiplier < 1.0 {
                return Err(Error::config(format!(
                    "{name}.backoffMultiplier must be at least 1.0"
                )));
            }
            if retry.max_delay < retry.initial_delay {
                return Err(Error::config(format!(
                    "{name}.maxDelayMs must not be shorter than initialDelayMs"
                )));
            }
        }
        if self.apply_retry.max_attempts == 0 {
            return Err(Error::config("applyRetry.maxAttempts must be bounded"));
        }
        Ok(())
    }
}

/// A partially written retry block. Fields left out keep the controller's
/// default for that block, not [`RetryConfig::default`].
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
struct RetryOverlay {
    max_attempts: Option<u32>,
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
}

impl RetryOverlay {
    fn over(self, base: RetryConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            initial_delay: self
                .initial_delay_ms
                .map_or(base.initial_delay, Duration::from_millis),
            max_delay: self.max_delay_ms.map_or(base.max_delay, Duration::from_millis),
            backoff_multiplier: self.backoff_multiplier.unwrap_or(base.backoff_multiplier),
        }
    }
}

fn backoff_over_defaults<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RetryConfig, D::Error> {
    let overlay = Option::<RetryOverlay>::deserialize(deserializer)?.unwrap_or_default();
    Ok(overlay.over(ControllerConfig::default().backoff))
}

fn apply_retry_over_defaults<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<RetryConfig, D::Error> {
    let overlay = Option::<RetryOverlay>::deserialize(deserializer)?.unwrap_or_default();
    Ok(overlay.over(ControllerConfig::default().apply_retry))
}

/// Serde adapter storing a [`Duration`] as integer milliseconds
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
