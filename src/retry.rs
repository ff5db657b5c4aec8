//! Retry utilities with exponential backoff and jitter.
//!
//! Two consumers share one [`RetryConfig`] shape: the work queue computes a
//! requeue delay from a resource's consecutive failure count, and the
//! attribute apply loop retries a single transient `SetAttribute` call in
//! place a small number of times.
//!
//! # Example
//!
//! ```ignore
//! use converge::retry::retry_with_backoff;
//!
//! let result = retry_with_backoff(
//!     &config.apply_retry,
//!     "set-attribute",
//!     Error::is_retryable,
//!     || async { adapter.set_attribute(id, &change).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::millis;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    #[serde(with = "millis", rename = "initialDelayMs")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "millis", rename = "maxDelayMs")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay before retry number `attempt` (1-based), capped at
    /// `max_delay`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before retry number `attempt` with 0.5x to 1.5x jitter applied,
    /// never exceeding `max_delay`.
    pub fn jittered_backoff_for(&self, attempt: u32) -> Duration {
        jitter(self.backoff_for(attempt)).min(self.max_delay)
    }
}

/// Add jitter: 0.5x to 1.5x of the delay
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries while `should_retry` accepts the error, until success or until
/// max_attempts is exhausted. Errors rejected by `should_retry` are returned
/// immediately.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `should_retry` - Decides whether an error is worth another attempt
/// * `operation` - The async operation to retry
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.jittered_backoff_for(attempt);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
