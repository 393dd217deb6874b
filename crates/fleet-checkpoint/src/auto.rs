use crate::checkpoint::CheckpointStore;
use fleet_core::{CheckpointConfig, FleetResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Checkpoints retained per (agent, workflow) after an automatic save.
pub const DEFAULT_KEEP: usize = 5;

/// Saves a workflow's state every `interval` operations and keeps only the
/// newest few checkpoints.
pub struct AutoCheckpointer {
    store: Arc<CheckpointStore>,
    agent_id: String,
    workflow_id: String,
    interval: u64,
    keep: usize,
    operations: AtomicU64,
}

impl AutoCheckpointer {
    /// An `interval` of zero is treated as one.
    pub fn new(
        store: Arc<CheckpointStore>,
        agent_id: impl Into<String>,
        workflow_id: impl Into<String>,
        interval: u64,
    ) -> Self {
        Self {
            store,
            agent_id: agent_id.into(),
            workflow_id: workflow_id.into(),
            interval: interval.max(1),
            keep: DEFAULT_KEEP,
            operations: AtomicU64::new(0),
        }
    }

    /// Interval and retention from `config`.
    pub fn from_config(
        store: Arc<CheckpointStore>,
        agent_id: impl Into<String>,
        workflow_id: impl Into<String>,
        config: &CheckpointConfig,
    ) -> Self {
        Self::new(store, agent_id, workflow_id, config.interval).with_keep(config.keep)
    }

    /// Checkpoints kept after each save. Zero is treated as one, so the
    /// newest save always survives.
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    /// Agent whose state is checkpointed.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Workflow whose state is checkpointed.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Operations counted so far.
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Count one operation; on every `interval`-th call save `state` and
    /// clean up old checkpoints. Returns the new checkpoint id when a save
    /// happened.
    pub async fn maybe_checkpoint<T: Serialize + ?Sized>(
        &self,
        state: &T,
    ) -> FleetResult<Option<String>> {
        let count = self.operations.fetch_add(1, Ordering::SeqCst) + 1;
        if count % self.interval != 0 {
            return Ok(None);
        }
        self.force_checkpoint(state).await.map(Some)
    }

    /// Save immediately, regardless of the operation counter.
    pub async fn force_checkpoint<T: Serialize + ?Sized>(&self, state: &T) -> FleetResult<String> {
        let id = self.store.save(state, &self.agent_id, &self.workflow_id).await?;
        let deleted = self
            .store
            .cleanup_old_checkpoints(&self.agent_id, &self.workflow_id, self.keep)
            .await?;
        debug!(
            checkpoint_id = %id,
            agent_id = %self.agent_id,
            workflow_id = %self.workflow_id,
            deleted,
            "auto checkpoint"
        );
        Ok(id)
    }

    /// Latest saved state, or `None` when the workflow has no checkpoint.
    pub async fn recover(&self) -> FleetResult<Option<Value>> {
        let Some(id) = self
            .store
            .get_latest_checkpoint(&self.agent_id, &self.workflow_id)
            .await
        else {
            return Ok(None);
        };
        let state = self.store.load_checkpoint(&id).await?;
        info!(
            checkpoint_id = %id,
            agent_id = %self.agent_id,
            workflow_id = %self.workflow_id,
            "state recovered"
        );
        Ok(Some(state))
    }

    /// [`recover`](Self::recover), deserialized into `T`.
    pub async fn recover_as<T: DeserializeOwned>(&self) -> FleetResult<Option<T>> {
        match self.recover().await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
