use fleet_core::RateLimitConfig;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct Bucket {
    config: RateLimitConfig,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            config,
            tokens: config.max_tokens(),
            last_refill: now,
        }
    }

    // Lazy refill. A long idle gap yields one large step, clamped to the cap.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.config.refill_per_sec)
            .min(self.config.max_tokens());
        self.last_refill = now;
    }
}

#[derive(Default)]
struct Buckets {
    buckets: HashMap<String, Bucket>,
    overrides: HashMap<String, RateLimitConfig>,
}

impl Buckets {
    fn config_for(&self, key: &str, default: RateLimitConfig) -> RateLimitConfig {
        self.overrides.get(key).copied().unwrap_or(default)
    }
}

/// Token bucket rate limiter, one bucket per key.
///
/// Buckets are created lazily on first use and start full
/// (`capacity + burst` tokens). Refill is computed on access from the elapsed
/// time; no background timer runs.
pub struct RateLimiter {
    default_config: RateLimitConfig,
    inner: Mutex<Buckets>,
}

impl RateLimiter {
    /// Create a limiter applying `config` to every key without an override.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            default_config: config,
            inner: Mutex::new(Buckets::default()),
        }
    }

    /// Use a dedicated configuration for `key`. An existing bucket keeps its
    /// tokens, clamped to the new cap.
    pub async fn set_limit(&self, key: impl Into<String>, config: RateLimitConfig) {
        let key = key.into();
        let mut inner = self.inner.lock().await;
        if let Some(bucket) = inner.buckets.get_mut(&key) {
            bucket.refill(Instant::now());
            bucket.config = config;
            bucket.tokens = bucket.tokens.min(config.max_tokens());
        }
        inner.overrides.insert(key, config);
    }

    /// Try to take `n` tokens for `key`.
    /// Returns `true` if admitted, `false` if rate limited. Never blocks on
    /// anything but the bucket map lock.
    pub async fn try_acquire(&self, key: &str, n: u32) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let config = inner.config_for(key, self.default_config);

        let bucket = inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(config, now));

        bucket.refill(now);

        let wanted = f64::from(n);
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            true
        } else {
            debug!(key, wanted, available = bucket.tokens, "rate limited");
            false
        }
    }

    /// Poll [`try_acquire`](Self::try_acquire) until it succeeds or `timeout`
    /// elapses. Only the calling task sleeps; dropping the future cancels the
    /// wait without side effects.
    ///
    /// Returns `false` immediately when `n` exceeds the bucket cap, since such
    /// a request can never be satisfied.
    pub async fn wait_for_token(&self, key: &str, n: u32, timeout: Duration) -> bool {
        let config = self.config_for(key).await;
        if f64::from(n) > config.max_tokens() {
            debug!(key, n, cap = config.max_tokens(), "request exceeds bucket cap");
            return false;
        }

        let poll = Duration::from_millis(config.poll_interval_ms.max(1));
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire(key, n).await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Tokens currently available for `key`, after refill. Keys never seen
    /// report a full bucket.
    pub async fn available(&self, key: &str) -> f64 {
        let mut inner = self.inner.lock().await;
        let config = inner.config_for(key, self.default_config);
        match inner.buckets.get_mut(key) {
            Some(bucket) => {
                bucket.refill(Instant::now());
                bucket.tokens
            }
            None => config.max_tokens(),
        }
    }

    /// Configuration in effect for `key`.
    pub async fn config_for(&self, key: &str) -> RateLimitConfig {
        self.inner.lock().await.config_for(key, self.default_config)
    }

    /// Number of live buckets.
    pub async fn bucket_count(&self) -> usize {
        self.inner.lock().await.buckets.len()
    }

    /// Remove expired buckets (no activity for the given duration).
    pub async fn cleanup(&self, max_idle: Duration) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner
            .buckets
            .retain(|_, b| now.saturating_duration_since(b.last_refill) < max_idle);
    }
}
