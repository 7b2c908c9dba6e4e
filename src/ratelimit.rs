//! Per-credential token-bucket rate limiting for outbound delivery.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// A continuously refilling token bucket. Capacity equals the configured
/// per-minute rate, so short bursts are allowed up to one minute's quota.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn per_minute(rate: u32) -> Self {
        let capacity = f64::from(rate.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, or report how long to wait for the next one.
    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().expect("bucket lock");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Wait until a token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            match self.try_take() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

/// Buckets keyed by delivery credential, created on first use. The rate
/// comes from the config snapshot on every lookup, so a reload that
/// changes it replaces the bucket.
#[derive(Default)]
pub struct RateLimiters {
    buckets: DashMap<String, (u32, Arc<TokenBucket>)>,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, credential: &str, per_minute: u32) -> Arc<TokenBucket> {
        let mut entry = self
            .buckets
            .entry(credential.to_string())
            .or_insert_with(|| (per_minute, Arc::new(TokenBucket::per_minute(per_minute))));
        if entry.0 != per_minute {
            *entry = (per_minute, Arc::new(TokenBucket::per_minute(per_minute)));
        }
        entry.1.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_up_to_capacity() {
        let bucket = TokenBucket::per_minute(3);
        assert!(bucket.try_take().is_ok());
        assert!(bucket.try_take().is_ok());
        assert!(bucket.try_take().is_ok());
        let wait = bucket.try_take().unwrap_err();
        assert!(wait > Duration::ZERO);
        // 3/min refills one token every 20 seconds
        assert!(wait <= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::per_minute(2);
        let start = Instant::now();

        bucket.acquire().await;
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));

        // Third call must wait for a refill (30s at 2/min)
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(29));
    }

    #[test]
    fn test_registry_shares_bucket_per_credential() {
        let limiters = RateLimiters::new();
        let a1 = limiters.bucket("cred-a", 10);
        let a2 = limiters.bucket("cred-a", 10);
        let b = limiters.bucket("cred-b", 10);
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[test]
    fn test_rate_change_replaces_bucket() {
        let limiters = RateLimiters::new();
        let before = limiters.bucket("cred-a", 10);
        let after = limiters.bucket("cred-a", 40);
        assert!(!Arc::ptr_eq(&before, &after));

        // New bucket carries the new capacity
        for _ in 0..40 {
            assert!(after.try_take().is_ok());
        }
        assert!(after.try_take().is_err());
    }
}
