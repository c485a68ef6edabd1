//! Bounded retry with exponential backoff for broker operations.

use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::EventBusConfig;
use crate::error::Result;

/// Attempts an operation up to `retry_count` times in total, sleeping
/// `base_delay * multiplier^attempt` (capped at `max_delay`) between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            retry_count,
            base_delay,
            multiplier,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Policy without any waiting between attempts.
    pub fn immediate(retry_count: u32) -> Self {
        Self::new(retry_count, Duration::ZERO, 1)
    }

    pub fn from_config(config: &EventBusConfig) -> Self {
        Self {
            retry_count: config.retry_count,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error,
    /// or the attempt budget is spent. The last error is returned.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.retry_count.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Broker operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        error!(operation, attempts, error = %e, "Broker operation failed after all retries");
                    }
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), 2)
    }
}
