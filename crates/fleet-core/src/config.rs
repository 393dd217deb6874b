use crate::error::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, usually read from `fleet.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Root directory for persisted state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Task queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Token-bucket settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Checkpoint store settings.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Agent directory settings.
    #[serde(default)]
    pub directory: DirectoryConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            queue: QueueConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            checkpoint: CheckpointConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl FleetConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> FleetResult<Self> {
        let config: FleetConfig =
            toml::from_str(raw).map_err(|e| FleetError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            FleetError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Directory holding checkpoint blobs and the index. Relative paths are
    /// resolved against `data_dir`.
    pub fn checkpoint_dir(&self) -> PathBuf {
        if self.checkpoint.dir.is_absolute() {
            self.checkpoint.dir.clone()
        } else {
            self.data_dir.join(&self.checkpoint.dir)
        }
    }

    /// Reject values that would make a component misbehave.
    pub fn validate(&self) -> FleetResult<()> {
        if self.rate_limit.capacity <= 0.0 {
            return Err(FleetError::Config("rate_limit.capacity must be > 0".into()));
        }
        if self.rate_limit.burst < 0.0 || self.rate_limit.refill_per_sec < 0.0 {
            return Err(FleetError::Config(
                "rate_limit.burst and rate_limit.refill_per_sec must be >= 0".into(),
            ));
        }
        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 || cb.half_open_max_calls == 0 {
            return Err(FleetError::Config(
                "circuit_breaker thresholds and half_open_max_calls must be > 0".into(),
            ));
        }
        if cb.success_threshold > cb.half_open_max_calls {
            return Err(FleetError::Config(format!(
                "circuit_breaker.success_threshold ({}) cannot exceed half_open_max_calls ({})",
                cb.success_threshold, cb.half_open_max_calls
            )));
        }
        if self.checkpoint.interval == 0 {
            return Err(FleetError::Config("checkpoint.interval must be > 0".into()));
        }
        if self.checkpoint.keep == 0 {
            return Err(FleetError::Config("checkpoint.keep must be > 0".into()));
        }
        if self.queue.consume_batch_size == 0 {
            return Err(FleetError::Config("queue.consume_batch_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Deadline for a single backing-store operation.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Buffered messages per pub/sub channel before slow subscribers lag.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Retry budget for messages built by the orchestrator.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Messages popped per consume call in worker loops.
    #[serde(default = "default_batch_size")]
    pub consume_batch_size: usize,
    /// Sleep between polls when a consumer loop finds its queue empty.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl QueueConfig {
    /// Store deadline as a [`Duration`].
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Consumer idle poll as a [`Duration`].
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            default_max_retries: default_max_retries(),
            consume_batch_size: default_batch_size(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

/// Token-bucket settings applied to every key without an override.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Steady-state bucket size.
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    /// Extra headroom above `capacity`.
    #[serde(default = "default_burst")]
    pub burst: f64,
    /// Tokens added per second.
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    /// Poll step used by `wait_for_token`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl RateLimitConfig {
    /// Upper bound on tokens held by one bucket.
    pub fn max_tokens(&self) -> f64 {
        self.capacity + self.burst
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            burst: default_burst(),
            refill_per_sec: default_refill_per_sec(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successes in half-open that close the breaker.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long an open breaker waits before probing.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Calls admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
    /// Minimum spacing between "circuit open" log lines per breaker.
    #[serde(default = "default_reject_log_interval_secs")]
    pub reject_log_interval_secs: u64,
}

impl CircuitBreakerConfig {
    /// Open-state timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Rejection log spacing as a [`Duration`].
    pub fn reject_log_interval(&self) -> Duration {
        Duration::from_secs(self.reject_log_interval_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_secs: default_timeout_secs(),
            half_open_max_calls: default_half_open_max_calls(),
            reject_log_interval_secs: default_reject_log_interval_secs(),
        }
    }
}

/// What `load_checkpoint` does when the stored hash does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityPolicy {
    /// Refuse the load with `IntegrityMismatch`.
    #[default]
    Reject,
    /// Log a warning and return the decoded value anyway.
    WarnAndProceed,
}

/// Checkpoint store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Blob + index directory, relative to `data_dir` unless absolute.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
    /// Zlib-compress blobs.
    #[serde(default = "default_true")]
    pub compress: bool,
    /// Operations between automatic checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub interval: u64,
    /// Checkpoints retained per (agent, workflow) by automatic cleanup.
    #[serde(default = "default_keep")]
    pub keep: usize,
    /// Hash mismatch handling.
    #[serde(default)]
    pub integrity: IntegrityPolicy,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            compress: true,
            interval: default_checkpoint_interval(),
            keep: default_keep(),
            integrity: IntegrityPolicy::default(),
        }
    }
}

/// Agent directory settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Agents silent for longer than this are marked offline by a sweep.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Minimum spacing between sweeps triggered by `sweep_if_due`.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl DirectoryConfig {
    /// Heartbeat timeout as a [`Duration`].
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_store_timeout_ms() -> u64 {
    2_000
}
fn default_broadcast_capacity() -> usize {
    1_024
}
fn default_max_retries() -> u32 {
    crate::message::DEFAULT_MAX_RETRIES
}
fn default_batch_size() -> usize {
    10
}
fn default_idle_poll_ms() -> u64 {
    100
}
fn default_capacity() -> f64 {
    10.0
}
fn default_burst() -> f64 {
    5.0
}
fn default_refill_per_sec() -> f64 {
    10.0
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_half_open_max_calls() -> u32 {
    3
}
fn default_reject_log_interval_secs() -> u64 {
    10
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}
fn default_true() -> bool {
    true
}
fn default_checkpoint_interval() -> u64 {
    10
}
fn default_keep() -> usize {
    5
}
fn default_heartbeat_timeout_secs() -> u64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    5
}
