use fleet_core::{CircuitBreakerConfig, FleetError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow; consecutive failures are counted.
    Closed,
    /// Calls are rejected until the timeout elapses.
    Open,
    /// A limited number of probe calls decide whether to close again.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of one breaker, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted.
    pub failure_count: u32,
    /// Successes counted while half-open.
    pub success_count: u32,
    /// Calls admitted in the current half-open window.
    pub half_open_calls: u32,
    /// Milliseconds since the last recorded failure.
    pub since_last_failure_ms: Option<u64>,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    half_open_calls: u32,
    // Bumped on every state change so a stale permit cannot touch a newer probe window.
    generation: u64,
    last_reject_log: Option<Instant>,
    suppressed_rejections: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            half_open_calls: 0,
            generation: 0,
            last_reject_log: None,
            suppressed_rejections: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.generation += 1;
        self.half_open_calls = 0;
        self.success_count = 0;
    }
}

/// Failure-isolation state machine guarding one downstream dependency.
///
/// State is checked and updated under a short lock; the protected future
/// always runs with the lock released.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// A closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thresholds and timeouts.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose timeout has passed still reports
    /// `Open` until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Counters and state as of now.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_calls: inner.half_open_calls,
            since_last_failure_ms: inner
                .last_failure
                .map(|t| Instant::now().saturating_duration_since(t).as_millis() as u64),
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Fails fast with [`FleetError::CircuitOpen`] while open, or
    /// [`FleetError::CircuitHalfOpenLimit`] once the half-open probe budget is
    /// spent; `f` is not invoked in either case. Any `Err` returned by `f`
    /// counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<FleetError>,
    {
        let mut permit = self.admit()?;
        let outcome = f().await;
        permit.settled = true;
        match &outcome {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        outcome
    }

    /// Administrative override: force `Closed` and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed);
        inner.failure_count = 0;
        inner.last_failure = None;
        info!(breaker = %self.name, "circuit reset");
    }

    fn admit(&self) -> Result<Permit<'_>, FleetError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| now.saturating_duration_since(t));
                let ready = elapsed.map_or(true, |e| e >= self.config.timeout());
                if !ready {
                    self.log_rejection(&mut inner, now, "open");
                    return Err(FleetError::CircuitOpen(self.name.clone()));
                }
                inner.transition(CircuitState::HalfOpen);
                inner.half_open_calls = 1;
                info!(breaker = %self.name, "circuit half-open, probing");
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    self.log_rejection(&mut inner, now, "half-open limit reached");
                    return Err(FleetError::CircuitHalfOpenLimit(self.name.clone()));
                }
                inner.half_open_calls += 1;
            }
        }
        Ok(Permit {
            breaker: self,
            generation: inner.generation,
            settled: false,
        })
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.transition(CircuitState::Closed);
                    inner.failure_count = 0;
                    info!(breaker = %self.name, "circuit closed");
                }
            }
            // A call admitted before another caller tripped the breaker.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.transition(CircuitState::Open);
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.transition(CircuitState::Open);
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    // A permit dropped without an outcome (caller cancelled) gives its probe slot back.
    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen
            && inner.generation == generation
            && inner.half_open_calls > 0
        {
            inner.half_open_calls -= 1;
        }
    }

    fn log_rejection(&self, inner: &mut BreakerState, now: Instant, reason: &str) {
        let due = inner
            .last_reject_log
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.reject_log_interval());
        if due {
            info!(
                breaker = %self.name,
                reason,
                suppressed = inner.suppressed_rejections,
                "call rejected by circuit breaker"
            );
            inner.last_reject_log = Some(now);
            inner.suppressed_rejections = 0;
        } else {
            inner.suppressed_rejections += 1;
        }
    }
}

struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation);
        }
    }
}

/// Named breakers, created on first use.
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Empty registry; new breakers use `default_config`.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `name`, created with the default configuration if absent.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config)
    }

    /// Breaker for `name`, created with `config` if absent. An existing
    /// breaker keeps its original configuration.
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
        )
    }

    /// The breaker called `name`, if one was created.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(name).cloned()
    }

    /// Run `f` through the breaker named `name`.
    pub async fn call<F, Fut, T, E>(&self, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<FleetError>,
    {
        let breaker = self.get_or_create(name);
        breaker.call(f).await
    }

    /// Force one breaker closed. Returns `false` if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Force every breaker closed.
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Names of breakers not currently closed.
    pub fn open_breakers(&self) -> Vec<String> {
        self.snapshots()
            .into_iter()
            .filter(|s| s.state != CircuitState::Closed)
            .map(|s| s.name)
            .collect()
    }
}
