//! Core types and error definitions for the Fleet task-distribution layer.
//!
//! This crate provides the foundational types shared across all Fleet crates:
//! the queue message model, the unified error type, and configuration.
//!
//! # Main types
//!
//! - [`FleetError`]: Unified error enum for all Fleet components.
//! - [`FleetResult`]: Convenience alias for `Result<T, FleetError>`.
//! - [`ErrorClass`]: How a caller should react to an error.
//! - [`Message`]: A tenant-scoped, prioritized queue message.
//! - [`QueueType`]: The logical queue a message travels on.
//! - [`TaskPayload`]: Typed payload of a task request.
//! - [`FleetConfig`]: TOML configuration for every component.

/// TOML configuration.
pub mod config;
/// Error type and classification.
pub mod error;
/// Queue message model.
pub mod message;

pub use config::{
    CheckpointConfig, CircuitBreakerConfig, DirectoryConfig, FleetConfig, IntegrityPolicy,
    QueueConfig, RateLimitConfig,
};
pub use error::{ErrorClass, FleetError, FleetResult};
pub use message::{
    clamp_priority, Message, MessageKind, QueueType, TaskPayload, DEFAULT_MAX_RETRIES,
    DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
