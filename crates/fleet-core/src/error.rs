use thiserror::Error;

/// A convenience `Result` alias using [`FleetError`].
pub type FleetResult<T> = Result<T, FleetError>;

/// Top-level error type shared by every Fleet component.
///
/// Variants are grouped by how a caller is expected to react; see
/// [`FleetError::class`].
#[derive(Error, Debug)]
pub enum FleetError {
    /// The queue backing store could not be reached.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A backing store operation exceeded its deadline.
    #[error("Store timeout: {operation} exceeded {timeout_ms}ms")]
    StoreTimeout {
        /// Name of the store operation that timed out.
        operation: String,
        /// The configured deadline.
        timeout_ms: u64,
    },

    /// The rate limiter refused admission for this key.
    #[error("Rate limit exceeded for '{0}'")]
    RateLimitExceeded(String),

    /// The named circuit breaker is open and rejected the call.
    #[error("Circuit '{0}' is open")]
    CircuitOpen(String),

    /// The named circuit breaker is half-open and its probe budget is spent.
    #[error("Circuit '{0}' breaker half-open, limit reached")]
    CircuitHalfOpenLimit(String),

    /// A checkpoint's stored hash does not match its contents.
    #[error("Checkpoint '{checkpoint_id}' failed integrity check (expected {expected}, got {actual})")]
    IntegrityMismatch {
        /// Checkpoint that failed verification.
        checkpoint_id: String,
        /// Hash recorded in the metadata index.
        expected: String,
        /// Hash computed over the loaded bytes.
        actual: String,
    },

    /// A checkpoint blob could not be decoded at all.
    #[error("Checkpoint '{0}' is corrupt: {1}")]
    CorruptCheckpoint(String, String),

    /// No checkpoint (index entry or blob) exists for this id.
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// A checkpoint id contains characters unsafe for blob naming.
    #[error("Invalid checkpoint id: {0}")]
    InvalidCheckpointId(String),

    /// An agent with this name is already registered.
    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(String),

    /// No agent with this name is registered.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// A message priority lies outside `1..=10`.
    #[error("Invalid priority {0}: must be within 1..=10")]
    InvalidPriority(i64),

    /// No registered agent satisfies the selection criteria.
    #[error("No eligible agent: {0}")]
    NoEligibleAgent(String),

    /// A message handler or task executor reported a failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a caller should react to a [`FleetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Infrastructure hiccup; retry the operation with backoff.
    Transient,
    /// Not a failure of the operation; try again later.
    Backpressure,
    /// Stored data failed verification.
    Integrity,
    /// The requested item does not exist.
    NotFound,
    /// A caller programming error; surface immediately.
    Validation,
    /// Anything else.
    Internal,
}

impl FleetError {
    /// Classify this error for dispatch decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            FleetError::QueueUnavailable(_) | FleetError::StoreTimeout { .. } => {
                ErrorClass::Transient
            }
            FleetError::RateLimitExceeded(_)
            | FleetError::CircuitOpen(_)
            | FleetError::CircuitHalfOpenLimit(_) => ErrorClass::Backpressure,
            FleetError::IntegrityMismatch { .. } | FleetError::CorruptCheckpoint(..) => {
                ErrorClass::Integrity
            }
            FleetError::CheckpointNotFound(_) => ErrorClass::NotFound,
            FleetError::DuplicateAgent(_)
            | FleetError::UnknownAgent(_)
            | FleetError::InvalidPriority(_)
            | FleetError::InvalidCheckpointId(_)
            | FleetError::Config(_) => ErrorClass::Validation,
            FleetError::NoEligibleAgent(_)
            | FleetError::Handler(_)
            | FleetError::Json(_)
            | FleetError::Io(_) => ErrorClass::Internal,
        }
    }

    /// `true` for store-level failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// `true` for "try later" signals (rate limit, open breaker).
    pub fn is_backpressure(&self) -> bool {
        self.class() == ErrorClass::Backpressure
    }
}
