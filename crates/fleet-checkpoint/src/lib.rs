//! Durable checkpoints for long-running agent workflows.
//!
//! State is stored as hashed, optionally zlib-compressed JSON blobs, with a
//! single metadata index deciding which checkpoints exist.
//!
//! # Main types
//!
//! - [`CheckpointStore`]: Save, load, verify, list and prune checkpoints.
//! - [`AutoCheckpointer`]: Interval-driven saves with retention.
//! - [`BlobStore`] / [`IndexStore`]: Storage backends (file or memory).

/// Interval-driven checkpointing.
pub mod auto;
/// Checkpoint store and metadata.
pub mod checkpoint;
/// Blob and index storage backends.
pub mod store;

pub use auto::{AutoCheckpointer, DEFAULT_KEEP};
pub use checkpoint::{CheckpointMetadata, CheckpointOptions, CheckpointStore, INDEX_FILE};
pub use store::{BlobStore, FileBlobStore, FileIndexStore, IndexStore, MemoryBlobStore, MemoryIndexStore};
