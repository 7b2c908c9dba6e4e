//! Bounded retry with exponential backoff and jitter.
//!
//! Wraps outbound network calls. Retryable failures (timeouts, rate
//! limits) are reattempted up to the configured limit; fatal failures
//! propagate immediately. Rate-limit responses carrying a retry-after
//! hint override the computed backoff.

use crate::config::LimitsConfig;
use crate::error::{RelayError, RelayResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self {
            max_attempts: limits.retry_attempts.max(1),
            base_delay: Duration::from_millis(limits.retry_base_delay_ms),
            max_delay: Duration::from_millis(limits.retry_max_delay_ms),
        }
    }

    /// Exponential delay for a zero-based attempt index, with 50-100%
    /// jitter so concurrent retries spread out.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        exp.mul_f64(jitter)
    }

    /// Run `operation` with retries. Fatal errors propagate as-is;
    /// exhausting all attempts yields [`RelayError::DeliveryFailed`].
    pub async fn run<T, F, Fut>(&self, op: &str, mut operation: F) -> RelayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        tracing::error!(op, attempts = attempt, error = %e, "retries exhausted");
                        return Err(RelayError::DeliveryFailed {
                            attempts: attempt,
                            last: e.to_string(),
                        });
                    }
                    let delay = e
                        .retry_after()
                        .unwrap_or_else(|| self.backoff_delay(attempt - 1))
                        .min(self.max_delay);
                    tracing::warn!(
                        op,
                        attempt,
                        max = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
