use crate::store::{BlobStore, FileBlobStore, FileIndexStore, IndexStore};
use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use fleet_core::{CheckpointConfig, FleetError, FleetResult, IntegrityPolicy};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File name of the metadata index inside a checkpoint directory.
pub const INDEX_FILE: &str = "checkpoint_index.json";

/// Index entry describing one stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    /// Unique id, also the blob key.
    pub checkpoint_id: String,
    /// When the checkpoint was saved.
    pub timestamp: DateTime<Utc>,
    /// Owning agent.
    pub agent_id: String,
    /// Owning workflow.
    pub workflow_id: String,
    /// Hex sha256 of the uncompressed serialized state.
    pub state_hash: String,
    /// Size of the stored blob.
    pub size_bytes: u64,
    /// Whether the blob is zlib-compressed.
    pub compressed: bool,
    /// Store-assigned order, breaks timestamp ties.
    #[serde(default)]
    pub sequence: u64,
}

impl CheckpointMetadata {
    fn recency(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }
}

/// Behaviour knobs for a [`CheckpointStore`].
#[derive(Debug, Clone, Copy)]
pub struct CheckpointOptions {
    /// Compress new blobs with zlib.
    pub compress: bool,
    /// What to do when a loaded blob fails its hash check.
    pub integrity: IntegrityPolicy,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            compress: true,
            integrity: IntegrityPolicy::Reject,
        }
    }
}

impl From<&CheckpointConfig> for CheckpointOptions {
    fn from(config: &CheckpointConfig) -> Self {
        Self {
            compress: config.compress,
            integrity: config.integrity,
        }
    }
}

#[derive(Default)]
struct IndexState {
    entries: BTreeMap<String, CheckpointMetadata>,
    version: u64,
    next_sequence: u64,
}

type WorkflowKey = (String, String);

/// Durable checkpoint store: blobs addressed by checkpoint id plus one
/// metadata index that decides which checkpoints exist.
///
/// The index is read fully at open and rewritten fully after every mutation,
/// which suits moderate checkpoint counts. Mutations update the in-memory
/// index under its lock; the resulting snapshot is written under a separate
/// persist lock that discards snapshots older than the last one written.
pub struct CheckpointStore {
    blobs: Arc<dyn BlobStore>,
    index_store: Arc<dyn IndexStore>,
    index: Mutex<IndexState>,
    persisted_version: Mutex<u64>,
    workflow_locks: parking_lot::Mutex<HashMap<WorkflowKey, Arc<Mutex<()>>>>,
    options: CheckpointOptions,
}

impl CheckpointStore {
    /// Open a store over the given backends, loading the index document.
    pub async fn open(
        blobs: Arc<dyn BlobStore>,
        index_store: Arc<dyn IndexStore>,
        options: CheckpointOptions,
    ) -> FleetResult<Self> {
        let mut state = IndexState::default();
        if let Some(raw) = index_store.load().await? {
            state.entries = serde_json::from_slice(&raw).map_err(|e| {
                FleetError::CorruptCheckpoint(INDEX_FILE.to_string(), e.to_string())
            })?;
            state.next_sequence = state
                .entries
                .values()
                .map(|m| m.sequence + 1)
                .max()
                .unwrap_or(0);
        }
        info!(checkpoints = state.entries.len(), "checkpoint index loaded");
        Ok(Self {
            blobs,
            index_store,
            index: Mutex::new(state),
            persisted_version: Mutex::new(0),
            workflow_locks: parking_lot::Mutex::new(HashMap::new()),
            options,
        })
    }

    /// Open a file-backed store rooted at `dir`.
    pub async fn open_dir(dir: impl AsRef<Path>, options: CheckpointOptions) -> FleetResult<Self> {
        let dir = dir.as_ref();
        let blobs = Arc::new(FileBlobStore::new(dir).await?);
        let index = Arc::new(FileIndexStore::new(dir.join(INDEX_FILE)));
        Self::open(blobs, index, options).await
    }

    /// Blob backend, exposed for maintenance tooling.
    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Options this store was opened with.
    pub fn options(&self) -> CheckpointOptions {
        self.options
    }

    /// Persist `state` and return its checkpoint id.
    ///
    /// The state is serialized to canonical JSON, hashed, optionally
    /// compressed, written as a blob, and only then recorded in the index.
    /// Saves for the same (agent, workflow) pair run one at a time.
    pub async fn save_checkpoint(
        &self,
        state: &Value,
        agent_id: &str,
        workflow_id: &str,
        checkpoint_id: Option<&str>,
    ) -> FleetResult<String> {
        let checkpoint_id = match checkpoint_id {
            Some(id) => {
                validate_id(id)?;
                id.to_string()
            }
            None => format!("ckpt-{}", Uuid::new_v4().simple()),
        };
        let _guard = self.lock_workflow(agent_id, workflow_id).await;

        let raw = serde_json::to_vec(state)?;
        let state_hash = hash_bytes(&raw);
        let blob = if self.options.compress {
            compress(&raw)?
        } else {
            raw
        };
        let size_bytes = blob.len() as u64;
        self.blobs.put(&checkpoint_id, blob).await?;

        let (snapshot, version) = {
            let mut index = self.index.lock().await;
            let sequence = index.next_sequence;
            index.next_sequence += 1;
            index.entries.insert(
                checkpoint_id.clone(),
                CheckpointMetadata {
                    checkpoint_id: checkpoint_id.clone(),
                    timestamp: Utc::now(),
                    agent_id: agent_id.to_string(),
                    workflow_id: workflow_id.to_string(),
                    state_hash,
                    size_bytes,
                    compressed: self.options.compress,
                    sequence,
                },
            );
            index.version += 1;
            (index.entries.clone(), index.version)
        };
        self.persist(snapshot, version).await?;

        info!(
            checkpoint_id = %checkpoint_id,
            agent_id,
            workflow_id,
            size_bytes,
            compressed = self.options.compress,
            "checkpoint saved"
        );
        Ok(checkpoint_id)
    }

    /// Serialize any value and save it.
    pub async fn save<T: Serialize + ?Sized>(
        &self,
        state: &T,
        agent_id: &str,
        workflow_id: &str,
    ) -> FleetResult<String> {
        let value = serde_json::to_value(state)?;
        self.save_checkpoint(&value, agent_id, workflow_id, None).await
    }

    /// Load and verify a checkpoint.
    ///
    /// A hash mismatch fails with [`FleetError::IntegrityMismatch`] under
    /// [`IntegrityPolicy::Reject`]; under [`IntegrityPolicy::WarnAndProceed`]
    /// it is logged and the decoded value is returned anyway.
    pub async fn load_checkpoint(&self, checkpoint_id: &str) -> FleetResult<Value> {
        let (meta, raw) = self.read_verified_bytes(checkpoint_id).await?;
        let actual = hash_bytes(&raw);
        if actual != meta.state_hash {
            match self.options.integrity {
                IntegrityPolicy::Reject => {
                    warn!(checkpoint_id, "checkpoint hash mismatch, load refused");
                    return Err(FleetError::IntegrityMismatch {
                        checkpoint_id: checkpoint_id.to_string(),
                        expected: meta.state_hash,
                        actual,
                    });
                }
                IntegrityPolicy::WarnAndProceed => {
                    warn!(
                        checkpoint_id,
                        expected = %meta.state_hash,
                        actual = %actual,
                        "checkpoint hash mismatch, proceeding"
                    );
                }
            }
        }
        serde_json::from_slice(&raw)
            .map_err(|e| FleetError::CorruptCheckpoint(checkpoint_id.to_string(), e.to_string()))
    }

    /// Load a checkpoint into a concrete type.
    pub async fn load<T: DeserializeOwned>(&self, checkpoint_id: &str) -> FleetResult<T> {
        let value = self.load_checkpoint(checkpoint_id).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Check a checkpoint's hash without deserializing it. Undecodable blobs
    /// report `false`.
    pub async fn verify_checkpoint(&self, checkpoint_id: &str) -> FleetResult<bool> {
        match self.read_verified_bytes(checkpoint_id).await {
            Ok((meta, raw)) => Ok(hash_bytes(&raw) == meta.state_hash),
            Err(FleetError::CorruptCheckpoint(..)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Index entry for one checkpoint.
    pub async fn metadata(&self, checkpoint_id: &str) -> Option<CheckpointMetadata> {
        self.index.lock().await.entries.get(checkpoint_id).cloned()
    }

    /// Checkpoints matching the filters, newest first.
    pub async fn list_checkpoints(
        &self,
        agent_id: Option<&str>,
        workflow_id: Option<&str>,
    ) -> Vec<CheckpointMetadata> {
        let index = self.index.lock().await;
        let mut found: Vec<CheckpointMetadata> = index
            .entries
            .values()
            .filter(|m| agent_id.map_or(true, |a| m.agent_id == a))
            .filter(|m| workflow_id.map_or(true, |w| m.workflow_id == w))
            .cloned()
            .collect();
        drop(index);
        found.sort_by(|a, b| b.recency().cmp(&a.recency()));
        found
    }

    /// Id of the newest checkpoint for the pair, if any.
    pub async fn get_latest_checkpoint(&self, agent_id: &str, workflow_id: &str) -> Option<String> {
        self.list_checkpoints(Some(agent_id), Some(workflow_id))
            .await
            .into_iter()
            .next()
            .map(|m| m.checkpoint_id)
    }

    /// Remove a checkpoint. The index entry goes first; a blob left behind
    /// by a failed delete is unreachable and swept by [`prune_orphans`](Self::prune_orphans).
    pub async fn delete_checkpoint(&self, checkpoint_id: &str) -> FleetResult<bool> {
        let removed = self.remove_entries(&[checkpoint_id.to_string()]).await?;
        if removed.is_empty() {
            return Ok(false);
        }
        self.blobs.delete(checkpoint_id).await?;
        info!(checkpoint_id, "checkpoint deleted");
        Ok(true)
    }

    /// Keep the `keep_count` newest checkpoints for the pair and delete the
    /// rest. Returns how many were deleted.
    pub async fn cleanup_old_checkpoints(
        &self,
        agent_id: &str,
        workflow_id: &str,
        keep_count: usize,
    ) -> FleetResult<usize> {
        let _guard = self.lock_workflow(agent_id, workflow_id).await;
        let stale: Vec<String> = self
            .list_checkpoints(Some(agent_id), Some(workflow_id))
            .await
            .into_iter()
            .skip(keep_count)
            .map(|m| m.checkpoint_id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let removed = self.remove_entries(&stale).await?;
        for id in &removed {
            self.blobs.delete(id).await?;
        }
        debug!(agent_id, workflow_id, deleted = removed.len(), "old checkpoints cleaned up");
        Ok(removed.len())
    }

    /// Delete blobs that have no index entry. Returns how many were removed.
    pub async fn prune_orphans(&self) -> FleetResult<usize> {
        let keys = self.blobs.list().await?;
        let orphans: Vec<String> = {
            let index = self.index.lock().await;
            keys.into_iter()
                .filter(|k| !index.entries.contains_key(k))
                .collect()
        };
        let mut pruned = 0;
        for key in &orphans {
            if self.blobs.delete(key).await? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, "orphaned checkpoint blobs removed");
        }
        Ok(pruned)
    }

    /// Number of indexed checkpoints.
    pub async fn len(&self) -> usize {
        self.index.lock().await.entries.len()
    }

    /// Whether no checkpoints are indexed.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn read_verified_bytes(&self, checkpoint_id: &str) -> FleetResult<(CheckpointMetadata, Vec<u8>)> {
        let meta = self
            .metadata(checkpoint_id)
            .await
            .ok_or_else(|| FleetError::CheckpointNotFound(checkpoint_id.to_string()))?;
        let blob = self.blobs.get(checkpoint_id).await?.ok_or_else(|| {
            FleetError::CheckpointNotFound(format!("{checkpoint_id} (blob missing)"))
        })?;
        let raw = if meta.compressed {
            decompress(&blob).map_err(|e| {
                FleetError::CorruptCheckpoint(checkpoint_id.to_string(), e.to_string())
            })?
        } else {
            blob
        };
        Ok((meta, raw))
    }

    async fn remove_entries(&self, ids: &[String]) -> FleetResult<Vec<String>> {
        let (removed, snapshot, version) = {
            let mut index = self.index.lock().await;
            let removed: Vec<String> = ids
                .iter()
                .filter(|id| index.entries.remove(id.as_str()).is_some())
                .cloned()
                .collect();
            if removed.is_empty() {
                return Ok(removed);
            }
            index.version += 1;
            (removed, index.entries.clone(), index.version)
        };
        self.persist(snapshot, version).await?;
        Ok(removed)
    }

    async fn persist(
        &self,
        snapshot: BTreeMap<String, CheckpointMetadata>,
        version: u64,
    ) -> FleetResult<()> {
        let mut persisted = self.persisted_version.lock().await;
        if version <= *persisted {
            // A newer snapshot, which includes this mutation, is already on disk.
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        self.index_store.save(bytes).await?;
        *persisted = version;
        Ok(())
    }

    async fn lock_workflow(&self, agent_id: &str, workflow_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.workflow_locks.lock();
            Arc::clone(
                locks
                    .entry((agent_id.to_string(), workflow_id.to_string()))
                    .or_default(),
            )
        };
        lock.lock_owned().await
    }
}

fn validate_id(id: &str) -> FleetResult<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(FleetError::InvalidCheckpointId(id.to_string()))
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn compress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn decompress(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
