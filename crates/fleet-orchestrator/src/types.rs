use crate::directory::DirectoryStats;
use fleet_admission::BreakerSnapshot;
use fleet_core::DEFAULT_PRIORITY;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A unit of work submitted to [`Orchestrator::dispatch`](crate::Orchestrator::dispatch).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    /// Capability the executing agent must advertise.
    pub capability: String,
    /// Restrict selection to this agent type.
    #[serde(default)]
    pub agent_type: Option<String>,
    /// Workflow the task belongs to.
    #[serde(default)]
    pub workflow_id: Option<String>,
    /// Task input handed to the executor.
    pub input: Value,
    /// Priority, clamped into 1..=10 on publish.
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Falls back to the queue's configured retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_priority() -> i64 {
    i64::from(DEFAULT_PRIORITY)
}

impl DispatchRequest {
    /// A request at the default priority.
    pub fn new(capability: impl Into<String>, input: Value) -> Self {
        Self {
            capability: capability.into(),
            agent_type: None,
            workflow_id: None,
            input,
            priority: default_priority(),
            max_retries: None,
        }
    }

    /// Restrict selection to `agent_type`.
    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    /// Tag the task with a workflow.
    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Out-of-range values are clamped into 1..=10.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Where a dispatched task went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    /// Id of the queued task message.
    pub message_id: Uuid,
    /// Agent the task was assigned to.
    pub agent: String,
    /// Priority after clamping.
    pub priority: u8,
}

/// Counters for one [`Orchestrator::process_batch`](crate::Orchestrator::process_batch) call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Tasks that ran successfully.
    pub processed: usize,
    /// Failures requeued with a decayed priority.
    pub retried: usize,
    /// Failures moved to the dead-letter queue.
    pub dead_lettered: usize,
    /// Put back untouched because the agent's breaker refused the call.
    pub deferred: usize,
    /// Progress checkpoints saved.
    pub checkpoints: usize,
}

impl BatchReport {
    /// Messages settled, excluding checkpoints.
    pub fn total(&self) -> usize {
        self.processed + self.retried + self.dead_lettered + self.deferred
    }
}

/// Health summary. Open breakers and dead letters put the orchestrator in
/// degraded mode; neither is fatal.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    /// Any breaker open or any dead letter present.
    pub degraded: bool,
    /// Names of breakers currently open.
    pub open_breakers: Vec<String>,
    /// Every breaker's counters.
    pub breakers: Vec<BreakerSnapshot>,
    /// Dead-letter queue size per tenant seen by this orchestrator.
    pub dead_letters: BTreeMap<String, usize>,
    /// Directory counts.
    pub agents: DirectoryStats,
}
