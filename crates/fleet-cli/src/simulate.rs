//! In-process simulation driving the full dispatch pipeline against a flaky
//! executor.

use async_trait::async_trait;
use fleet_checkpoint::AutoCheckpointer;
use fleet_core::{FleetConfig, FleetError, FleetResult, Message, QueueType, TaskPayload};
use fleet_orchestrator::{
    tenant_rate_key, BatchReport, DispatchRequest, Orchestrator, OrchestratorStatus, TaskExecutor,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CAPABILITIES: [&str; 2] = ["search", "summarize"];

/// Knobs for one simulation run.
#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub tenants: usize,
    pub tasks: usize,
    pub agents: usize,
    /// Percentage of attempts that fail, 0..=100.
    pub failure_percent: u8,
    pub max_rounds: usize,
}

#[derive(Debug, Serialize)]
pub struct SimulationSummary {
    pub dispatched: usize,
    pub throttled: usize,
    pub rounds: usize,
    pub batches: BatchReport,
    pub status: OrchestratorStatus,
}

/// Fails a deterministic share of attempts, varying with the retry count so
/// most failures clear up on a later attempt.
struct FlakyExecutor {
    failure_percent: u8,
}

#[async_trait]
impl TaskExecutor for FlakyExecutor {
    async fn execute(&self, agent: &str, message: &Message, task: &TaskPayload) -> FleetResult<Value> {
        let roll = (message.id.as_u128() % 100 + u128::from(message.retry_count) * 37) % 100;
        if roll < u128::from(self.failure_percent) {
            return Err(FleetError::Handler(format!("{agent} failed on attempt {}", message.retry_count + 1)));
        }
        Ok(json!({"agent": agent, "capability": task.capability}))
    }
}

pub async fn run(config: &FleetConfig, params: &SimulationParams) -> FleetResult<SimulationSummary> {
    let orchestrator = Orchestrator::from_config(config).await?;
    for n in 0..params.agents.max(1) {
        let capabilities = if n % 2 == 0 {
            &CAPABILITIES[..]
        } else {
            &CAPABILITIES[..1]
        };
        orchestrator
            .directory()
            .register(&format!("agent-{n}"), "worker", capabilities.iter().copied(), Map::new())
            .await?;
    }

    let tenants: Vec<String> = (0..params.tenants.max(1)).map(|t| format!("tenant-{t}")).collect();
    let mut dispatched = 0;
    let mut throttled = 0;
    for i in 0..params.tasks {
        let tenant = &tenants[i % tenants.len()];
        let request = DispatchRequest::new(CAPABILITIES[i % CAPABILITIES.len()], json!({"n": i}))
            .with_priority((i % 10) as i64 + 1);
        if dispatch_with_backoff(&orchestrator, tenant, request).await? {
            dispatched += 1;
        } else {
            throttled += 1;
        }
    }
    info!(dispatched, throttled, "simulation tasks dispatched");

    let executor = FlakyExecutor {
        failure_percent: params.failure_percent.min(100),
    };
    let checkpointers: Vec<AutoCheckpointer> = tenants
        .iter()
        .map(|tenant| {
            AutoCheckpointer::from_config(
                Arc::clone(orchestrator.checkpoints()),
                "simulator",
                tenant.as_str(),
                &config.checkpoint,
            )
        })
        .collect();

    let mut totals = BatchReport::default();
    let mut rounds = 0;
    while rounds < params.max_rounds {
        rounds += 1;
        for (tenant, checkpointer) in tenants.iter().zip(&checkpointers) {
            let report = orchestrator
                .process_batch(tenant, &executor, Some(checkpointer))
                .await?;
            totals.processed += report.processed;
            totals.retried += report.retried;
            totals.dead_lettered += report.dead_lettered;
            totals.deferred += report.deferred;
            totals.checkpoints += report.checkpoints;
        }
        if pending(&orchestrator, &tenants).await? == 0 {
            break;
        }
    }

    let remaining = pending(&orchestrator, &tenants).await?;
    if remaining > 0 {
        warn!(remaining, rounds, "simulation stopped with tasks still queued");
    }
    Ok(SimulationSummary {
        dispatched,
        throttled,
        rounds,
        batches: totals,
        status: orchestrator.status().await?,
    })
}

/// Dispatch, retrying while the tenant is throttled for up to two seconds.
/// Returns `false` when the task was refused for backpressure.
async fn dispatch_with_backoff(
    orchestrator: &Orchestrator,
    tenant: &str,
    request: DispatchRequest,
) -> FleetResult<bool> {
    let limits = orchestrator
        .admission()
        .limiter()
        .config_for(&tenant_rate_key(tenant))
        .await;
    let poll = Duration::from_millis(limits.poll_interval_ms.max(1));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        match orchestrator.dispatch(tenant, request.clone()).await {
            Ok(_) => return Ok(true),
            Err(FleetError::RateLimitExceeded(_)) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(poll).await;
            }
            Err(e) if e.is_backpressure() => return Ok(false),
            Err(e) => return Err(e),
        }
    }
}

async fn pending(orchestrator: &Orchestrator, tenants: &[String]) -> FleetResult<usize> {
    let mut total = 0;
    for tenant in tenants {
        total += orchestrator.queue().queue_size(QueueType::Tasks, tenant).await?;
    }
    Ok(total)
}
