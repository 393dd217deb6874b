use crate::error::{FleetError, FleetResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lowest admissible message priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest admissible message priority.
pub const MAX_PRIORITY: u8 = 10;
/// Priority assigned when the publisher does not choose one.
pub const DEFAULT_PRIORITY: u8 = 5;
/// Retry budget assigned when the publisher does not choose one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The logical queue a message is published to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Work waiting to be executed by an agent.
    Tasks,
    /// Results reported back by agents.
    Results,
    /// Status and lifecycle events.
    Events,
    /// Messages that exhausted their retry budget.
    DeadLetter,
}

impl QueueType {
    /// Stable string form used in store keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Tasks => "tasks",
            QueueType::Results => "results",
            QueueType::Events => "events",
            QueueType::DeadLetter => "dead_letter",
        }
    }

    /// Store key for this queue scoped to one tenant.
    pub fn key(&self, tenant_id: &str) -> String {
        format!("queue:{}:{}", self.as_str(), tenant_id)
    }
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a message carries, serialized as the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A unit of work for an agent (payload is a [`TaskPayload`]).
    TaskRequest,
    /// The outcome of a task.
    TaskResult,
    /// An agent status change.
    StatusUpdate,
    /// Agent liveness ping.
    Heartbeat,
    /// Administrative control message.
    Control,
    /// A type this build does not know about, from a foreign producer.
    #[serde(other)]
    Unknown,
}

/// Payload of a [`MessageKind::TaskRequest`] message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    /// Capability the executing agent must provide.
    pub capability: String,
    /// Restrict execution to agents of this type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    /// Agent picked at dispatch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    /// Workflow this task belongs to, used for checkpointing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Task input handed to the agent.
    #[serde(default)]
    pub input: Value,
}

impl TaskPayload {
    /// A payload requiring `capability` with the given input.
    pub fn new(capability: impl Into<String>, input: Value) -> Self {
        Self {
            capability: capability.into(),
            agent_type: None,
            assigned_agent: None,
            workflow_id: None,
            input,
        }
    }

    /// Restrict to agents of `agent_type`.
    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    /// Attach the workflow id.
    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

/// A tenant-scoped queue message. Serializes to the camelCase wire shape
/// shared with producers and consumers in other processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Owning tenant.
    pub tenant_id: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Delivery priority, `1..=10`, higher first.
    pub priority: u8,
    /// UTC creation time.
    pub timestamp: DateTime<Utc>,
    /// Redelivery attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Redelivery budget before dead-lettering.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Message {
    /// Creates a message with default priority and retry budget.
    pub fn new(kind: MessageKind, tenant_id: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            tenant_id: tenant_id.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            timestamp: Utc::now(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Creates a [`MessageKind::TaskRequest`] carrying `task`.
    pub fn task(tenant_id: impl Into<String>, task: &TaskPayload) -> FleetResult<Self> {
        let payload = match serde_json::to_value(task)? {
            Value::Object(map) => map,
            other => {
                return Err(FleetError::Handler(format!(
                    "task payload must serialize to an object, got {other}"
                )))
            }
        };
        Ok(Self::new(MessageKind::TaskRequest, tenant_id, payload))
    }

    /// Sets the priority, clamping into `1..=10`.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Decodes the payload as a [`TaskPayload`].
    pub fn task_payload(&self) -> FleetResult<TaskPayload> {
        Ok(serde_json::from_value(Value::Object(self.payload.clone()))?)
    }

    /// Replaces the payload with `task`.
    pub fn set_task_payload(&mut self, task: &TaskPayload) -> FleetResult<()> {
        if let Value::Object(map) = serde_json::to_value(task)? {
            self.payload = map;
        }
        Ok(())
    }

    /// Rejects priorities outside `1..=10`.
    pub fn validate(&self) -> FleetResult<()> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(FleetError::InvalidPriority(i64::from(self.priority)));
        }
        Ok(())
    }

    /// Lowers priority by one, never below [`MIN_PRIORITY`].
    pub fn decay_priority(&mut self) {
        self.priority = self.priority.saturating_sub(1).max(MIN_PRIORITY);
    }

    /// `true` once the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }

    /// Serializes to the wire JSON form.
    pub fn to_wire(&self) -> FleetResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses the wire JSON form.
    pub fn from_wire(raw: &str) -> FleetResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Clamps an arbitrary integer into the admissible priority range.
pub fn clamp_priority(priority: i64) -> u8 {
    priority.clamp(i64::from(MIN_PRIORITY), i64::from(MAX_PRIORITY)) as u8
}
