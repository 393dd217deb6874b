use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use crate::rate_limit::RateLimiter;
use fleet_core::{CircuitBreakerConfig, FleetConfig, FleetError, FleetResult, RateLimitConfig};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Gate in front of every dispatch: a per-key token bucket followed by a
/// per-name circuit breaker.
pub struct AdmissionController {
    limiter: RateLimiter,
    breakers: CircuitBreakerRegistry,
}

impl AdmissionController {
    /// Limiter and breaker registry with the given defaults.
    pub fn new(rate_limit: RateLimitConfig, circuit_breaker: CircuitBreakerConfig) -> Self {
        Self {
            limiter: RateLimiter::new(rate_limit),
            breakers: CircuitBreakerRegistry::new(circuit_breaker),
        }
    }

    /// Built from the `[rate_limit]` and `[circuit_breaker]` sections.
    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(config.rate_limit, config.circuit_breaker)
    }

    /// The per-key rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The breaker registry.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Non-blocking token check for `key`.
    pub async fn try_acquire(&self, key: &str, n: u32) -> bool {
        self.limiter.try_acquire(key, n).await
    }

    /// Block the calling task until `n` tokens are available or `timeout` passes.
    pub async fn wait_for_token(&self, key: &str, n: u32, timeout: Duration) -> bool {
        self.limiter.wait_for_token(key, n, timeout).await
    }

    /// Take one token for `key` or fail with [`FleetError::RateLimitExceeded`].
    pub async fn admit(&self, key: &str) -> FleetResult<()> {
        if self.limiter.try_acquire(key, 1).await {
            Ok(())
        } else {
            Err(FleetError::RateLimitExceeded(key.to_string()))
        }
    }

    /// Run `f` through the breaker named `breaker`.
    pub async fn call<F, Fut, T, E>(&self, breaker: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<FleetError>,
    {
        self.breakers.call(breaker, f).await
    }

    /// Rate-limit on `rate_key`, then run `f` through `breaker`. A rejected
    /// token never reaches the breaker, so backpressure does not count as a
    /// downstream failure.
    pub async fn guarded<F, Fut, T, E>(&self, rate_key: &str, breaker: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<FleetError>,
    {
        if let Err(e) = self.admit(rate_key).await {
            debug!(rate_key, breaker, "dispatch throttled");
            return Err(e.into());
        }
        self.call(breaker, f).await
    }

    /// Breaker snapshots for status reporting.
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }
}
