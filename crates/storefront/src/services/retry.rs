//! Bounded exponential backoff for idempotent downstream calls.
//!
//! Only errors that report themselves as transient are retried. Anything
//! else, in particular consistency failures, is returned on the first
//! occurrence.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::ReconcileConfig;

/// Classifies an error as worth retrying.
pub trait Transient {
    /// Timeouts, connection failures, HTTP 5xx and HTTP 429.
    fn is_transient(&self) -> bool;
}

/// Retry schedule: `base * 2^n`, capped at `max_delay`, `max_attempts` total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` is clamped to at least one.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub const fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Total attempts including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (0-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2_u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Run `operation`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient error
    /// once attempts are exhausted.
    pub async fn run<T, E, F, Fut>(&self, operation: &'static str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ReconcileConfig::default())
    }
}

impl From<&ReconcileConfig> for RetryPolicy {
    fn from(config: &ReconcileConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay, config.max_delay)
    }
}
