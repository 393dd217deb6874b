//! Admission control for Fleet dispatch.
//!
//! Provides the per-key token-bucket rate limiter, the per-name circuit
//! breaker state machine, and the [`AdmissionController`] that composes them.
//!
//! # Main types
//!
//! - [`RateLimiter`]: Lazily refilled token buckets keyed by string.
//! - [`CircuitBreaker`]: Closed / open / half-open failure isolation.
//! - [`CircuitBreakerRegistry`]: Named breakers created on first use.
//! - [`AdmissionController`]: Rate limit, then breaker, then the call.

/// Circuit breaker state machine and registry.
pub mod circuit_breaker;
/// Combined admission gate.
pub mod controller;
/// Token-bucket rate limiting.
pub mod rate_limit;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use controller::AdmissionController;
pub use rate_limit::RateLimiter;
