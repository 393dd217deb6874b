//! Task distribution and dispatch for Fleet.
//!
//! Implements the multi-tenant priority task queue with retry and
//! dead-letter handling, the agent directory used for discovery and load
//! balancing, and the [`Orchestrator`] that composes them with admission
//! control and checkpointing.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Dispatches tasks and processes batches end to end.
//! - [`TaskQueue`]: Tenant-scoped priority queues with retry and DLQ.
//! - [`AgentDirectory`]: Registration, heartbeats and least-busy selection.
//! - [`SortedStore`]: Backing store abstraction for the queue.

/// Agent registry, health and load balancing.
pub mod directory;
/// Dispatch and batch execution.
pub mod engine;
/// Sorted-set storage behind the queue.
pub mod sorted_store;
/// Priority task queue.
pub mod task_queue;
/// Request, report and status types.
pub mod types;

pub use directory::{AgentDirectory, AgentInfo, AgentStatus, DirectoryStats};
pub use engine::{tenant_rate_key, Orchestrator, TaskExecutor, QUEUE_BREAKER};
pub use sorted_store::{InMemorySortedStore, Score, SortedStore};
pub use task_queue::{
    handler_fn, ConsumerStats, FnHandler, MessageHandler, RetryOutcome, Subscription, TaskQueue,
};
pub use types::{BatchReport, DispatchOutcome, DispatchRequest, OrchestratorStatus};
