use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleet_core::{DirectoryConfig, FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Healthy and ready for work.
    Active,
    /// Healthy, nothing running.
    Idle,
    /// Running a task.
    Busy,
    /// Missed its heartbeat or taken out of rotation.
    Offline,
}

impl AgentStatus {
    /// Whether the agent may be handed new work.
    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Active | AgentStatus::Idle)
    }
}

/// A registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    /// Unique agent name.
    pub name: String,
    /// Free-form kind, used to filter selection.
    pub agent_type: String,
    /// Capabilities the agent advertises.
    pub capabilities: BTreeSet<String>,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Time of the last heartbeat (registration counts as one).
    pub last_heartbeat: DateTime<Utc>,
    /// Tasks dispatched to this agent so far.
    pub message_count: u64,
    /// Caller-supplied metadata.
    pub metadata: Map<String, Value>,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
    /// Registration order, used to break load ties.
    pub sequence: u64,
}

/// Aggregate counts for the directory.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStats {
    /// Registered agents.
    pub total: usize,
    /// Agents in [`AgentStatus::Active`].
    pub active: usize,
    /// Agents in [`AgentStatus::Idle`].
    pub idle: usize,
    /// Agents in [`AgentStatus::Busy`].
    pub busy: usize,
    /// Agents in [`AgentStatus::Offline`].
    pub offline: usize,
    /// Distinct capabilities advertised.
    pub capabilities: usize,
    /// Sum of every agent's message count.
    pub total_messages: u64,
}

// Agents and the capability index share one lock so they never drift apart.
#[derive(Default)]
struct DirectoryState {
    agents: HashMap<String, AgentInfo>,
    capability_index: HashMap<String, BTreeSet<String>>,
    next_sequence: u64,
    last_sweep: Option<DateTime<Utc>>,
}

impl DirectoryState {
    fn unindex(&mut self, name: &str, capabilities: &BTreeSet<String>) {
        for capability in capabilities {
            if let Some(names) = self.capability_index.get_mut(capability) {
                names.remove(name);
                if names.is_empty() {
                    self.capability_index.remove(capability);
                }
            }
        }
    }

    fn agent_mut(&mut self, name: &str) -> FleetResult<&mut AgentInfo> {
        self.agents
            .get_mut(name)
            .ok_or_else(|| FleetError::UnknownAgent(name.to_string()))
    }
}

/// Service discovery, heartbeat health and load balancing for agents.
pub struct AgentDirectory {
    state: RwLock<DirectoryState>,
    config: DirectoryConfig,
}

impl AgentDirectory {
    /// An empty directory.
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            config,
        }
    }

    /// Heartbeat and sweep settings.
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Register a new agent as `active`.
    ///
    /// Fails with [`FleetError::DuplicateAgent`] if the name is taken; the
    /// existing entry is left untouched.
    pub async fn register(
        &self,
        name: &str,
        agent_type: &str,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        metadata: Map<String, Value>,
    ) -> FleetResult<AgentInfo> {
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let mut state = self.state.write().await;
        if state.agents.contains_key(name) {
            return Err(FleetError::DuplicateAgent(name.to_string()));
        }

        let now = Utc::now();
        let info = AgentInfo {
            name: name.to_string(),
            agent_type: agent_type.to_string(),
            capabilities,
            status: AgentStatus::Active,
            last_heartbeat: now,
            message_count: 0,
            metadata,
            registered_at: now,
            sequence: state.next_sequence,
        };
        state.next_sequence += 1;
        for capability in &info.capabilities {
            state
                .capability_index
                .entry(capability.clone())
                .or_default()
                .insert(name.to_string());
        }
        state.agents.insert(name.to_string(), info.clone());
        info!(agent = name, agent_type, capabilities = info.capabilities.len(), "agent registered");
        Ok(info)
    }

    /// Remove an agent. Unknown names are ignored with a warning.
    pub async fn deregister(&self, name: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(info) = state.agents.remove(name) else {
            warn!(agent = name, "deregister of unknown agent ignored");
            return false;
        };
        state.unindex(name, &info.capabilities);
        info!(agent = name, "agent deregistered");
        true
    }

    /// Names of agents advertising `capability`, in name order.
    pub async fn find_by_capability(&self, capability: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .capability_index
            .get(capability)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Set an agent's status unconditionally.
    pub async fn update_status(&self, name: &str, status: AgentStatus) -> FleetResult<()> {
        let mut state = self.state.write().await;
        let agent = state.agent_mut(name)?;
        if agent.status != status {
            debug!(agent = name, from = ?agent.status, to = ?status, "agent status changed");
            agent.status = status;
        }
        Ok(())
    }

    /// Set `status` only if the agent is currently `expected`. Returns
    /// whether the status was changed.
    pub async fn update_status_if(
        &self,
        name: &str,
        expected: AgentStatus,
        status: AgentStatus,
    ) -> FleetResult<bool> {
        let mut state = self.state.write().await;
        let agent = state.agent_mut(name)?;
        if agent.status != expected {
            return Ok(false);
        }
        if expected != status {
            debug!(agent = name, from = ?expected, to = ?status, "agent status changed");
            agent.status = status;
        }
        Ok(true)
    }

    /// Record a heartbeat. An offline agent comes back as active.
    pub async fn heartbeat(&self, name: &str) -> FleetResult<()> {
        self.heartbeat_at(name, Utc::now()).await
    }

    /// [`heartbeat`](Self::heartbeat) at an explicit time.
    pub async fn heartbeat_at(&self, name: &str, now: DateTime<Utc>) -> FleetResult<()> {
        let mut state = self.state.write().await;
        let agent = state.agent_mut(name)?;
        agent.last_heartbeat = now;
        if agent.status == AgentStatus::Offline {
            agent.status = AgentStatus::Active;
            info!(agent = name, "agent back online");
        }
        Ok(())
    }

    /// Mark agents whose last heartbeat is older than the timeout as
    /// offline, and return every agent's status.
    pub async fn check_health(&self) -> BTreeMap<String, AgentStatus> {
        self.check_health_at(Utc::now()).await
    }

    /// [`check_health`](Self::check_health) at an explicit time.
    pub async fn check_health_at(&self, now: DateTime<Utc>) -> BTreeMap<String, AgentStatus> {
        let timeout = ChronoDuration::from_std(self.config.heartbeat_timeout())
            .unwrap_or(ChronoDuration::MAX);
        let mut state = self.state.write().await;
        state.last_sweep = Some(now);
        let mut report = BTreeMap::new();
        for agent in state.agents.values_mut() {
            if agent.status != AgentStatus::Offline && now - agent.last_heartbeat > timeout {
                warn!(
                    agent = %agent.name,
                    last_heartbeat = %agent.last_heartbeat,
                    "heartbeat timed out, agent marked offline"
                );
                agent.status = AgentStatus::Offline;
            }
            report.insert(agent.name.clone(), agent.status);
        }
        report
    }

    /// Run [`check_health_at`](Self::check_health_at) if the sweep interval
    /// has passed since the last sweep. Returns whether a sweep ran.
    pub async fn sweep_if_due(&self) -> bool {
        self.sweep_if_due_at(Utc::now()).await
    }

    /// [`sweep_if_due`](Self::sweep_if_due) at an explicit time.
    pub async fn sweep_if_due_at(&self, now: DateTime<Utc>) -> bool {
        let interval = ChronoDuration::from_std(self.config.sweep_interval())
            .unwrap_or(ChronoDuration::MAX);
        let due = {
            let state = self.state.read().await;
            state.last_sweep.map_or(true, |last| now - last >= interval)
        };
        if due {
            self.check_health_at(now).await;
        }
        due
    }

    /// The available agent with the fewest handled messages, optionally
    /// restricted by type and capability. Ties go to the earliest registered.
    pub async fn get_least_busy_agent(
        &self,
        agent_type: Option<&str>,
        capability: Option<&str>,
    ) -> Option<String> {
        let state = self.state.read().await;
        let candidates: Box<dyn Iterator<Item = &AgentInfo>> = match capability {
            Some(capability) => Box::new(
                state
                    .capability_index
                    .get(capability)
                    .into_iter()
                    .flatten()
                    .filter_map(|name| state.agents.get(name)),
            ),
            None => Box::new(state.agents.values()),
        };
        candidates
            .filter(|a| a.status.is_available())
            .filter(|a| agent_type.map_or(true, |t| a.agent_type == t))
            .min_by_key(|a| (a.message_count, a.sequence))
            .map(|a| a.name.clone())
    }

    /// Count one more message handled by `name`, returning the new total.
    pub async fn increment_message_count(&self, name: &str) -> FleetResult<u64> {
        let mut state = self.state.write().await;
        let agent = state.agent_mut(name)?;
        agent.message_count += 1;
        Ok(agent.message_count)
    }

    /// A snapshot of one agent.
    pub async fn get(&self, name: &str) -> Option<AgentInfo> {
        self.state.read().await.agents.get(name).cloned()
    }

    /// All agents in registration order.
    pub async fn list(&self) -> Vec<AgentInfo> {
        let state = self.state.read().await;
        let mut agents: Vec<AgentInfo> = state.agents.values().cloned().collect();
        agents.sort_by_key(|a| a.sequence);
        agents
    }

    /// Counts by status, capability and message volume.
    pub async fn get_stats(&self) -> DirectoryStats {
        let state = self.state.read().await;
        let mut stats = DirectoryStats {
            total: state.agents.len(),
            capabilities: state.capability_index.len(),
            ..DirectoryStats::default()
        };
        for agent in state.agents.values() {
            stats.total_messages += agent.message_count;
            match agent.status {
                AgentStatus::Active => stats.active += 1,
                AgentStatus::Idle => stats.idle += 1,
                AgentStatus::Busy => stats.busy += 1,
                AgentStatus::Offline => stats.offline += 1,
            }
        }
        stats
    }
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new(DirectoryConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn directory() -> AgentDirectory {
        let dir = AgentDirectory::default();
        dir.register("alpha", "worker", ["search", "summarize"], Map::new())
            .await
            .unwrap();
        dir.register("beta", "worker", ["search"], Map::new())
            .await
            .unwrap();
        dir.register("gamma", "reviewer", ["review"], Map::new())
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_register_indexes_capabilities() {
        let dir = directory().await;
        assert_eq!(dir.find_by_capability("search").await, vec!["alpha", "beta"]);
        assert_eq!(dir.find_by_capability("review").await, vec!["gamma"]);
        assert!(dir.find_by_capability("translate").await.is_empty());
        assert_eq!(dir.get("alpha").await.unwrap().status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn test_duplicate_register_leaves_original() {
        let dir = directory().await;
        dir.increment_message_count("beta").await.unwrap();
        let err = dir
            .register("beta", "other", ["translate"], Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::DuplicateAgent(_)));

        let beta = dir.get("beta").await.unwrap();
        assert_eq!(beta.agent_type, "worker");
        assert_eq!(beta.message_count, 1);
        assert!(dir.find_by_capability("translate").await.is_empty());
        assert_eq!(dir.find_by_capability("search").await, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_deregister_cleans_index() {
        let dir = directory().await;
        assert!(dir.deregister("alpha").await);
        assert!(!dir.deregister("alpha").await);
        assert_eq!(dir.find_by_capability("search").await, vec!["beta"]);
        assert!(dir.find_by_capability("summarize").await.is_empty());
        assert_eq!(dir.get_stats().await.capabilities, 2);
    }

    #[tokio::test]
    async fn test_unknown_agent_errors() {
        let dir = directory().await;
        assert!(matches!(
            dir.heartbeat("ghost").await,
            Err(FleetError::UnknownAgent(_))
        ));
        assert!(matches!(
            dir.update_status("ghost", AgentStatus::Busy).await,
            Err(FleetError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_least_busy_skips_unavailable() {
        let dir = directory().await;
        dir.increment_message_count("alpha").await.unwrap();
        assert_eq!(
            dir.get_least_busy_agent(None, Some("search")).await,
            Some("beta".to_string())
        );

        dir.update_status("beta", AgentStatus::Busy).await.unwrap();
        assert_eq!(
            dir.get_least_busy_agent(None, Some("search")).await,
            Some("alpha".to_string())
        );

        dir.update_status("alpha", AgentStatus::Offline).await.unwrap();
        assert_eq!(dir.get_least_busy_agent(None, Some("search")).await, None);
        assert_eq!(
            dir.get_least_busy_agent(Some("reviewer"), None).await,
            Some("gamma".to_string())
        );
        assert_eq!(dir.get_least_busy_agent(Some("reviewer"), Some("search")).await, None);
    }

    #[tokio::test]
    async fn test_conditional_status_update() {
        let dir = directory().await;
        dir.update_status("beta", AgentStatus::Offline).await.unwrap();
        assert!(!dir
            .update_status_if("beta", AgentStatus::Busy, AgentStatus::Active)
            .await
            .unwrap());
        assert_eq!(dir.get("beta").await.unwrap().status, AgentStatus::Offline);

        assert!(dir
            .update_status_if("alpha", AgentStatus::Active, AgentStatus::Busy)
            .await
            .unwrap());
        assert_eq!(dir.get("alpha").await.unwrap().status, AgentStatus::Busy);
        assert!(matches!(
            dir.update_status_if("ghost", AgentStatus::Active, AgentStatus::Busy).await,
            Err(FleetError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_ties_go_to_registration_order() {
        let dir = directory().await;
        assert_eq!(
            dir.get_least_busy_agent(Some("worker"), None).await,
            Some("alpha".to_string())
        );
    }

    #[tokio::test]
    async fn test_health_sweep_and_heartbeat_recovery() {
        let dir = directory().await;
        let later = Utc::now() + ChronoDuration::seconds(31);
        dir.heartbeat_at("gamma", later).await.unwrap();

        let report = dir.check_health_at(later).await;
        assert_eq!(report["alpha"], AgentStatus::Offline);
        assert_eq!(report["beta"], AgentStatus::Offline);
        assert_eq!(report["gamma"], AgentStatus::Active);
        assert_eq!(dir.get_stats().await.offline, 2);

        dir.heartbeat_at("alpha", later).await.unwrap();
        assert_eq!(dir.get("alpha").await.unwrap().status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn test_sweep_if_due_respects_interval() {
        let dir = directory().await;
        let now = Utc::now();
        assert!(dir.sweep_if_due_at(now).await);
        assert!(!dir.sweep_if_due_at(now + ChronoDuration::seconds(1)).await);
        assert!(dir.sweep_if_due_at(now + ChronoDuration::seconds(5)).await);
    }
}
