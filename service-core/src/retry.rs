//! Retry utilities for outbound calls to third-party HTTP APIs.
//!
//! Only errors that classify themselves as transient are retried; anything
//! else is returned to the caller on the first failure.

use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Classification hook for retryable errors.
pub trait Transient {
    /// `true` for failures worth another attempt (timeouts, 5xx, dropped
    /// connections). Business rejections must return `false`.
    fn is_transient(&self) -> bool;
}

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to randomize each backoff by up to 25% either way.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with the given attempt budget.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::with_max_attempts(1)
    }

    /// Backoff schedule. The attempt budget bounds the calls, not elapsed time.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(self.backoff_multiplier)
            .with_randomization_factor(if self.add_jitter { 0.25 } else { 0.0 })
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `f` until it succeeds, fails permanently, or the attempt budget is
/// spent. The last error is returned unchanged.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    f: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    retry_notify(
        config.backoff(),
        || {
            attempt += 1;
            let current = attempt;
            let call = f();
            async move {
                match call.await {
                    Ok(result) => {
                        if current > 1 {
                            info!(
                                operation = operation_name,
                                attempt = current,
                                "Call succeeded after retry"
                            );
                        }
                        Ok(result)
                    }
                    Err(error) if !error.is_transient() => {
                        warn!(
                            operation = operation_name,
                            error = %error,
                            "Call failed with permanent error, not retrying"
                        );
                        Err(backoff::Error::permanent(error))
                    }
                    Err(error) if current >= max_attempts => {
                        warn!(
                            operation = operation_name,
                            attempt = current,
                            error = %error,
                            "Call failed after max attempts"
                        );
                        Err(backoff::Error::permanent(error))
                    }
                    Err(error) => Err(backoff::Error::transient(error)),
                }
            }
        },
        |error: E, wait: Duration| {
            warn!(
                operation = operation_name,
                error = %error,
                backoff_ms = wait.as_millis() as u64,
                "Call failed, retrying after backoff"
            );
        },
    )
    .await
}
