use crate::directory::{AgentDirectory, AgentStatus};
use crate::task_queue::{RetryOutcome, TaskQueue};
use crate::types::{BatchReport, DispatchOutcome, DispatchRequest, OrchestratorStatus};
use async_trait::async_trait;
use fleet_admission::AdmissionController;
use fleet_checkpoint::{AutoCheckpointer, CheckpointOptions, CheckpointStore};
use fleet_core::{
    FleetConfig, FleetError, FleetResult, Message, MessageKind, QueueType, TaskPayload,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Breaker guarding publishes to the task queue.
pub const QUEUE_BREAKER: &str = "task_queue";

/// Runs a task on the agent it was assigned to.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `task` on `agent`, returning its output.
    async fn execute(&self, agent: &str, message: &Message, task: &TaskPayload) -> FleetResult<Value>;
}

/// Rate-limit key for a tenant.
pub fn tenant_rate_key(tenant_id: &str) -> String {
    format!("tenant:{tenant_id}")
}

/// Composes the directory, admission control, task queue and checkpoint
/// store into the dispatch and execution pipeline.
pub struct Orchestrator {
    queue: Arc<TaskQueue>,
    admission: Arc<AdmissionController>,
    directory: Arc<AgentDirectory>,
    checkpoints: Arc<CheckpointStore>,
    tenants: Mutex<BTreeSet<String>>,
}

impl Orchestrator {
    /// Compose already-built components.
    pub fn new(
        queue: Arc<TaskQueue>,
        admission: Arc<AdmissionController>,
        directory: Arc<AgentDirectory>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            queue,
            admission,
            directory,
            checkpoints,
            tenants: Mutex::new(BTreeSet::new()),
        }
    }

    /// Build every component from configuration: an in-memory queue and a
    /// file-backed checkpoint store under the configured directory.
    pub async fn from_config(config: &FleetConfig) -> FleetResult<Self> {
        config.validate()?;
        let checkpoints = CheckpointStore::open_dir(
            config.checkpoint_dir(),
            CheckpointOptions::from(&config.checkpoint),
        )
        .await?;
        Ok(Self::new(
            Arc::new(TaskQueue::in_memory(config.queue.clone())),
            Arc::new(AdmissionController::from_config(config)),
            Arc::new(AgentDirectory::new(config.directory)),
            Arc::new(checkpoints),
        ))
    }

    /// The task queue.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Rate limits and breakers.
    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// The agent directory.
    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    /// The checkpoint store.
    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    /// Pick the least busy capable agent, take a tenant token, and publish
    /// the task through the queue breaker.
    ///
    /// Throttling and an open breaker surface as backpressure errors; the
    /// caller should back off rather than treat them as failures.
    pub async fn dispatch(&self, tenant_id: &str, request: DispatchRequest) -> FleetResult<DispatchOutcome> {
        self.tenants.lock().insert(tenant_id.to_string());
        self.directory.sweep_if_due().await;

        let agent = self
            .directory
            .get_least_busy_agent(request.agent_type.as_deref(), Some(&request.capability))
            .await
            .ok_or_else(|| FleetError::NoEligibleAgent(request.capability.clone()))?;

        let mut payload = TaskPayload::new(request.capability.clone(), request.input);
        payload.agent_type = request.agent_type;
        payload.workflow_id = request.workflow_id;
        payload.assigned_agent = Some(agent.clone());
        let message = Message::task(tenant_id, &payload)?
            .with_priority(request.priority)
            .with_max_retries(
                request
                    .max_retries
                    .unwrap_or(self.queue.config().default_max_retries),
            );

        let queue = &self.queue;
        self.admission
            .guarded(&tenant_rate_key(tenant_id), QUEUE_BREAKER, || {
                queue.publish(QueueType::Tasks, &message)
            })
            .await?;
        // The task is already queued; a vanished agent must not fail the dispatch.
        if let Err(e) = self.directory.increment_message_count(&agent).await {
            warn!(agent = %agent, message_id = %message.id, error = %e, "message count not recorded");
        }

        info!(
            tenant = tenant_id,
            agent = %agent,
            message_id = %message.id,
            capability = %payload.capability,
            priority = message.priority,
            "task dispatched"
        );
        Ok(DispatchOutcome {
            message_id: message.id,
            agent,
            priority: message.priority,
        })
    }

    /// Consume one batch of tasks for `tenant_id` and run each through its
    /// agent's breaker.
    ///
    /// Successes publish a `task_result` and feed the checkpointer, failures
    /// go through retry, and calls refused by an open breaker are put back
    /// untouched. If the store fails while a message is being settled, that
    /// message and the rest of the batch are restored before the error is
    /// returned, so nothing popped is lost.
    pub async fn process_batch(
        &self,
        tenant_id: &str,
        executor: &dyn TaskExecutor,
        checkpointer: Option<&AutoCheckpointer>,
    ) -> FleetResult<BatchReport> {
        self.tenants.lock().insert(tenant_id.to_string());
        let batch_size = self.queue.config().consume_batch_size;
        let batch = self.queue.consume(QueueType::Tasks, tenant_id, batch_size).await?;
        let mut report = BatchReport::default();

        let mut pending = batch.into_iter();
        while let Some(message) = pending.next() {
            if let Err(e) = self
                .run_task(tenant_id, &message, executor, checkpointer, &mut report)
                .await
            {
                let rest = std::iter::once(message).chain(pending.by_ref());
                let restored = self.queue.restore(QueueType::Tasks, rest).await;
                warn!(tenant = tenant_id, restored, error = %e, "store failed mid-batch, batch restored");
                return Err(e);
            }
        }

        if report.total() > 0 {
            info!(
                tenant = tenant_id,
                processed = report.processed,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                deferred = report.deferred,
                "batch processed"
            );
        }
        Ok(report)
    }

    /// Degraded-mode summary across every tenant this orchestrator has seen.
    pub async fn status(&self) -> FleetResult<OrchestratorStatus> {
        let tenants: Vec<String> = self.tenants.lock().iter().cloned().collect();
        let mut dead_letters = BTreeMap::new();
        for tenant in tenants {
            let size = self.queue.queue_size(QueueType::DeadLetter, &tenant).await?;
            if size > 0 {
                dead_letters.insert(tenant, size);
            }
        }
        let open_breakers = self.admission.breakers().open_breakers();
        Ok(OrchestratorStatus {
            degraded: !open_breakers.is_empty() || !dead_letters.is_empty(),
            open_breakers,
            breakers: self.admission.breaker_snapshots(),
            dead_letters,
            agents: self.directory.get_stats().await,
        })
    }

    /// Latest checkpointed state for a workflow, if any.
    pub async fn recover(&self, agent_id: &str, workflow_id: &str) -> FleetResult<Option<Value>> {
        match self.checkpoints.get_latest_checkpoint(agent_id, workflow_id).await {
            Some(id) => Ok(Some(self.checkpoints.load_checkpoint(&id).await?)),
            None => Ok(None),
        }
    }

    // Any `Err` leaves `message` unsettled in the store.
    async fn run_task(
        &self,
        tenant_id: &str,
        message: &Message,
        executor: &dyn TaskExecutor,
        checkpointer: Option<&AutoCheckpointer>,
        report: &mut BatchReport,
    ) -> FleetResult<()> {
        let task = match message.task_payload() {
            Ok(task) => task,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "task payload unreadable");
                return self.record_retry(report, message.clone()).await;
            }
        };
        let agent = task
            .assigned_agent
            .clone()
            .unwrap_or_else(|| task.capability.clone());

        let claimed = self.claim(&agent).await;
        let result = self
            .admission
            .call(&agent, || executor.execute(&agent, message, &task))
            .await;
        if let Some(previous) = claimed {
            self.release(&agent, previous).await;
        }

        match result {
            Ok(output) => {
                self.publish_result(message, &agent, output).await?;
                report.processed += 1;
                if let Some(checkpointer) = checkpointer {
                    let progress = json!({
                        "tenant": tenant_id,
                        "lastMessageId": message.id,
                        "processed": report.processed,
                    });
                    match checkpointer.maybe_checkpoint(&progress).await {
                        Ok(Some(_)) => report.checkpoints += 1,
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "progress checkpoint failed"),
                    }
                }
            }
            Err(e) if e.is_backpressure() => {
                debug!(agent = %agent, message_id = %message.id, error = %e, "task deferred");
                self.queue.requeue(QueueType::Tasks, message).await?;
                report.deferred += 1;
            }
            Err(e) => {
                debug!(agent = %agent, message_id = %message.id, error = %e, "task failed");
                self.record_retry(report, message.clone()).await?;
            }
        }
        Ok(())
    }

    async fn record_retry(&self, report: &mut BatchReport, message: Message) -> FleetResult<()> {
        match self.queue.retry(QueueType::Tasks, message).await? {
            RetryOutcome::Requeued { .. } => report.retried += 1,
            RetryOutcome::DeadLettered { .. } => report.dead_lettered += 1,
        }
        Ok(())
    }

    async fn publish_result(&self, task: &Message, agent: &str, output: Value) -> FleetResult<()> {
        let mut payload = Map::new();
        payload.insert("taskId".into(), json!(task.id));
        payload.insert("agent".into(), json!(agent));
        payload.insert("output".into(), output);
        let result = Message::new(MessageKind::TaskResult, task.tenant_id.clone(), payload)
            .with_priority(i64::from(task.priority));
        self.queue.publish(QueueType::Results, &result).await
    }

    /// Mark an available agent busy, returning the status to restore.
    /// Offline, busy and unknown agents are left as they are.
    async fn claim(&self, agent: &str) -> Option<AgentStatus> {
        let previous = self.directory.get(agent).await?.status;
        if !previous.is_available() {
            return None;
        }
        match self
            .directory
            .update_status_if(agent, previous, AgentStatus::Busy)
            .await
        {
            Ok(true) => Some(previous),
            Ok(false) => None,
            Err(e) => {
                debug!(agent, error = %e, "status update skipped");
                None
            }
        }
    }

    /// Undo [`claim`](Self::claim) unless the status changed meanwhile.
    async fn release(&self, agent: &str, previous: AgentStatus) {
        if let Err(e) = self
            .directory
            .update_status_if(agent, AgentStatus::Busy, previous)
            .await
        {
            debug!(agent, error = %e, "status update skipped");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fleet_checkpoint::{MemoryBlobStore, MemoryIndexStore};
    use fleet_core::{CircuitBreakerConfig, DirectoryConfig, QueueConfig, RateLimitConfig};

    async fn orchestrator() -> Orchestrator {
        let checkpoints = CheckpointStore::open(
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryIndexStore::new()),
            CheckpointOptions::default(),
        )
        .await
        .unwrap();
        Orchestrator::new(
            Arc::new(TaskQueue::in_memory(QueueConfig::default())),
            Arc::new(AdmissionController::new(
                RateLimitConfig::default(),
                CircuitBreakerConfig::default(),
            )),
            Arc::new(AgentDirectory::new(DirectoryConfig::default())),
            Arc::new(checkpoints),
        )
    }

    #[tokio::test]
    async fn test_dispatch_without_agents() {
        let orch = orchestrator().await;
        let err = orch
            .dispatch("t1", DispatchRequest::new("search", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NoEligibleAgent(ref c) if c == "search"));
    }

    #[tokio::test]
    async fn test_dispatch_assigns_and_counts() {
        let orch = orchestrator().await;
        orch.directory()
            .register("a1", "worker", ["search"], Map::new())
            .await
            .unwrap();
        let outcome = orch
            .dispatch("t1", DispatchRequest::new("search", json!({"q": 1})).with_priority(12))
            .await
            .unwrap();
        assert_eq!(outcome.agent, "a1");
        assert_eq!(outcome.priority, 10);

        let queued = orch.queue().peek(QueueType::Tasks, "t1", 1).await.unwrap();
        let task = queued[0].task_payload().unwrap();
        assert_eq!(task.assigned_agent.as_deref(), Some("a1"));
        assert_eq!(orch.directory().get("a1").await.unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn test_batch_keeps_offline_agent_offline() {
        let orch = orchestrator().await;
        orch.directory()
            .register("a1", "worker", ["search"], Map::new())
            .await
            .unwrap();
        orch.dispatch("t1", DispatchRequest::new("search", json!({})))
            .await
            .unwrap();
        orch.directory()
            .update_status("a1", AgentStatus::Offline)
            .await
            .unwrap();

        struct Ok200;
        #[async_trait]
        impl TaskExecutor for Ok200 {
            async fn execute(&self, _agent: &str, _m: &Message, _t: &TaskPayload) -> FleetResult<Value> {
                Ok(Value::Null)
            }
        }
        orch.process_batch("t1", &Ok200, None).await.unwrap();
        assert_eq!(orch.directory().get("a1").await.unwrap().status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn test_batch_restores_idle_status() {
        let orch = orchestrator().await;
        orch.directory()
            .register("a1", "worker", ["search"], Map::new())
            .await
            .unwrap();
        orch.directory()
            .update_status("a1", AgentStatus::Idle)
            .await
            .unwrap();
        orch.dispatch("t1", DispatchRequest::new("search", json!({})))
            .await
            .unwrap();
        assert_eq!(orch.claim("a1").await, Some(AgentStatus::Idle));
        assert_eq!(orch.directory().get("a1").await.unwrap().status, AgentStatus::Busy);
        assert_eq!(orch.claim("a1").await, None);
        orch.release("a1", AgentStatus::Idle).await;
        assert_eq!(orch.directory().get("a1").await.unwrap().status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_recover_empty() {
        let orch = orchestrator().await;
        assert!(orch.recover("a", "w").await.unwrap().is_none());
        let status = orch.status().await.unwrap();
        assert!(!status.degraded);
    }
}
