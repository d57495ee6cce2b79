//! Token-bucket accounting primitive.
//!
//! The limiter in [`crate::ratelimit`] delegates all bucket arithmetic here;
//! it owns only tier lookup and response shaping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Bucket configuration.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Maximum requests per time window
    pub requests_per_window: u32,
    /// Time window duration
    pub window: Duration,
}

impl BucketConfig {
    /// Create a config with requests per minute. The full budget is
    /// available as burst at the start of a window.
    pub fn per_minute(requests: u32) -> Self {
        Self {
            requests_per_window: requests,
            window: Duration::from_secs(60),
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

/// Outcome of one bucket acquisition attempt.
#[derive(Debug, Clone)]
pub struct BucketDecision {
    pub allowed: bool,
    /// Whole tokens left after this attempt
    pub remaining: u32,
    /// Time until the next whole token refills (zero when tokens remain)
    pub retry_after: Duration,
}

/// Token bucket for a single identifier.
///
/// Tokens are scaled by 1000 for sub-token refill precision.
pub struct TokenBucket {
    tokens: AtomicU64,
    max_tokens: u64,
    window_millis: u64,
    /// Last refill timestamp (unix millis)
    last_refill: AtomicU64,
}

impl TokenBucket {
    pub fn new(config: &BucketConfig) -> Self {
        let max_tokens = (config.requests_per_window as u64) * 1000;
        let window_millis = (config.window.as_millis() as u64).max(1);

        Self {
            tokens: AtomicU64::new(max_tokens),
            max_tokens,
            window_millis,
            last_refill: AtomicU64::new(now_millis()),
        }
    }

    /// Try to acquire one token.
    pub fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::SeqCst);
            if current < 1000 {
                return false;
            }

            if self
                .tokens
                .compare_exchange(current, current - 1000, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
            // CAS failed, retry
        }
    }

    /// Whole tokens currently available.
    pub fn remaining(&self) -> u32 {
        self.refill();
        (self.tokens.load(Ordering::SeqCst) / 1000) as u32
    }

    /// Time until at least one whole token is available.
    pub fn retry_after(&self) -> Duration {
        self.refill();
        let current = self.tokens.load(Ordering::SeqCst);
        if current >= 1000 {
            return Duration::ZERO;
        }
        let needed = (1000 - current) as u128;
        let millis = (needed * self.window_millis as u128).div_ceil(self.max_tokens as u128);
        Duration::from_millis(millis as u64)
    }

    fn refill(&self) {
        let now = now_millis();
        let last = self.last_refill.load(Ordering::SeqCst);
        let elapsed = now.saturating_sub(last);
        if elapsed == 0 {
            return;
        }

        // Proportional refill over the window. When the elapsed time is too
        // short to earn a scaled token, last_refill is left alone so short
        // intervals accumulate instead of truncating to zero forever.
        let tokens_to_add =
            (elapsed as u128 * self.max_tokens as u128 / self.window_millis as u128) as u64;
        if tokens_to_add == 0 {
            return;
        }

        loop {
            let current = self.tokens.load(Ordering::SeqCst);
            let new_tokens = (current + tokens_to_add).min(self.max_tokens);
            if self
                .tokens
                .compare_exchange(current, new_tokens, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.last_refill.store(now, Ordering::SeqCst);
                break;
            }
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Registry of token buckets keyed by identifier.
pub struct BucketRegistry {
    buckets: RwLock<HashMap<String, TokenBucket>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire one token for `key`, creating the bucket on first use.
    ///
    /// A poisoned registry lock fails open: the request is admitted with a
    /// full budget reported.
    pub fn acquire(&self, key: &str, config: &BucketConfig) -> BucketDecision {
        // Fast path: bucket already exists
        {
            match self.buckets.read() {
                Ok(buckets) => {
                    if let Some(bucket) = buckets.get(key) {
                        return decide(bucket);
                    }
                }
                Err(_) => return fail_open(config),
            }
        }

        match self.buckets.write() {
            Ok(mut buckets) => {
                let bucket = buckets
                    .entry(key.to_string())
                    .or_insert_with(|| TokenBucket::new(config));
                decide(bucket)
            }
            Err(_) => fail_open(config),
        }
    }

    /// Drop the bucket for an identifier.
    pub fn remove(&self, key: &str) {
        if let Ok(mut buckets) = self.buckets.write() {
            buckets.remove(key);
        }
    }

    /// Drop all buckets.
    pub fn clear(&self) {
        if let Ok(mut buckets) = self.buckets.write() {
            buckets.clear();
        }
    }
}

impl Default for BucketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn decide(bucket: &TokenBucket) -> BucketDecision {
    let allowed = bucket.try_acquire();
    BucketDecision {
        allowed,
        remaining: bucket.remaining(),
        retry_after: if allowed {
            Duration::ZERO
        } else {
            bucket.retry_after()
        },
    }
}

fn fail_open(config: &BucketConfig) -> BucketDecision {
    tracing::warn!("rate limiter registry lock poisoned, failing open");
    BucketDecision {
        allowed: true,
        remaining: config.requests_per_window,
        retry_after: Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_exhaustion() {
        let config = BucketConfig {
            requests_per_window: 3,
            window: Duration::from_secs(60),
        };
        let bucket = TokenBucket::new(&config);

        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_remaining_decreases() {
        let config = BucketConfig {
            requests_per_window: 5,
            window: Duration::from_secs(60),
        };
        let bucket = TokenBucket::new(&config);

        assert_eq!(bucket.remaining(), 5);
        bucket.try_acquire();
        assert_eq!(bucket.remaining(), 4);
        bucket.try_acquire();
        assert_eq!(bucket.remaining(), 3);
    }

    #[test]
    fn test_retry_after_zero_when_available() {
        let bucket = TokenBucket::new(&BucketConfig::per_minute(10));
        assert_eq!(bucket.retry_after(), Duration::ZERO);
    }

    #[test]
    fn test_retry_after_bounded_by_window_share() {
        let config = BucketConfig {
            requests_per_window: 60,
            window: Duration::from_secs(60),
        };
        let bucket = TokenBucket::new(&config);
        while bucket.try_acquire() {}

        let wait = bucket.retry_after();
        assert!(wait > Duration::ZERO);
        // One token refills every window/limit = 1s
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn test_refill_restores_tokens() {
        let config = BucketConfig {
            requests_per_window: 100,
            window: Duration::from_millis(100),
        };
        let bucket = TokenBucket::new(&config);
        while bucket.try_acquire() {}
        assert_eq!(bucket.remaining(), 0);

        std::thread::sleep(Duration::from_millis(60));
        // Roughly half the window elapsed, so roughly half the budget is back
        assert!(bucket.remaining() >= 30);
    }

    #[test]
    fn test_registry_isolates_identifiers() {
        let registry = BucketRegistry::new();
        let config = BucketConfig {
            requests_per_window: 1,
            window: Duration::from_secs(60),
        };

        assert!(registry.acquire("a", &config).allowed);
        assert!(!registry.acquire("a", &config).allowed);
        // Different identifier, separate bucket
        assert!(registry.acquire("b", &config).allowed);
    }

    #[test]
    fn test_registry_clear() {
        let registry = BucketRegistry::new();
        let config = BucketConfig {
            requests_per_window: 1,
            window: Duration::from_secs(60),
        };

        assert!(registry.acquire("a", &config).allowed);
        assert!(!registry.acquire("a", &config).allowed);

        registry.clear();
        assert!(registry.acquire("a", &config).allowed);
    }
}
