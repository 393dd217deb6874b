#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end orchestration tests.
//!
//! Drives dispatch, batch execution, retry, dead-lettering, breaker deferral,
//! consumer cancellation and checkpoint recovery through the public API.

use async_trait::async_trait;
use fleet_admission::AdmissionController;
use fleet_checkpoint::{
    AutoCheckpointer, CheckpointOptions, CheckpointStore, MemoryBlobStore, MemoryIndexStore,
};
use fleet_core::{
    CircuitBreakerConfig, DirectoryConfig, FleetError, FleetResult, Message, QueueConfig,
    QueueType, RateLimitConfig, TaskPayload,
};
use fleet_orchestrator::*;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Test executors
// ---------------------------------------------------------------------------

/// Echoes the task input back with the executing agent.
struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, agent: &str, _message: &Message, task: &TaskPayload) -> FleetResult<Value> {
        Ok(json!({"agent": agent, "echo": task.input}))
    }
}

/// Fails every call, counting attempts.
#[derive(Default)]
struct FailingExecutor {
    calls: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for FailingExecutor {
    async fn execute(&self, _agent: &str, _message: &Message, _task: &TaskPayload) -> FleetResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FleetError::Handler("upstream returned 503".into()))
    }
}

/// Records task inputs in execution order.
#[derive(Default)]
struct RecordingExecutor {
    seen: std::sync::Mutex<Vec<Value>>,
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, _agent: &str, _message: &Message, task: &TaskPayload) -> FleetResult<Value> {
        self.seen.lock().unwrap().push(task.input.clone());
        Ok(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    orchestrator: Orchestrator,
    store: Arc<InMemorySortedStore>,
}

async fn fixture(rate: RateLimitConfig, breaker: CircuitBreakerConfig) -> Fixture {
    let store = Arc::new(InMemorySortedStore::new());
    let checkpoints = CheckpointStore::open(
        Arc::new(MemoryBlobStore::new()),
        Arc::new(MemoryIndexStore::new()),
        CheckpointOptions::default(),
    )
    .await
    .unwrap();
    let orchestrator = Orchestrator::new(
        Arc::new(TaskQueue::new(store.clone(), QueueConfig::default())),
        Arc::new(AdmissionController::new(rate, breaker)),
        Arc::new(AgentDirectory::new(DirectoryConfig::default())),
        Arc::new(checkpoints),
    );
    Fixture { orchestrator, store }
}

async fn default_fixture() -> Fixture {
    fixture(RateLimitConfig::default(), CircuitBreakerConfig::default()).await
}

async fn register(orch: &Orchestrator, name: &str, capabilities: &[&str]) {
    orch.directory()
        .register(name, "worker", capabilities.iter().copied(), Map::new())
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Dispatch and execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dispatch_balances_and_executes() {
    let fx = default_fixture().await;
    let orch = &fx.orchestrator;
    register(orch, "alpha", &["search"]).await;
    register(orch, "beta", &["search", "summarize"]).await;

    let mut agents = Vec::new();
    for i in 0..4 {
        let outcome = orch
            .dispatch("acme", DispatchRequest::new("search", json!({"n": i})))
            .await
            .unwrap();
        agents.push(outcome.agent);
    }
    assert_eq!(agents, vec!["alpha", "beta", "alpha", "beta"]);

    let report = orch.process_batch("acme", &EchoExecutor, None).await.unwrap();
    assert_eq!(report.processed, 4);
    assert_eq!(orch.queue().queue_size(QueueType::Tasks, "acme").await.unwrap(), 0);

    let results = orch.queue().peek(QueueType::Results, "acme", 10).await.unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|m| m.payload["output"]["agent"].is_string()));

    // Agents return to active after running.
    let stats = orch.directory().get_stats().await;
    assert_eq!(stats.active, 2);
    assert_eq!(stats.total_messages, 4);
}

#[tokio::test]
async fn test_batch_runs_highest_priority_first() {
    let fx = default_fixture().await;
    let orch = &fx.orchestrator;
    register(orch, "alpha", &["search"]).await;

    for priority in [3, 9, 5] {
        orch.dispatch(
            "acme",
            DispatchRequest::new("search", json!({"p": priority})).with_priority(priority),
        )
        .await
        .unwrap();
    }
    let executor = RecordingExecutor::default();
    orch.process_batch("acme", &executor, None).await.unwrap();

    let order: Vec<i64> = executor
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|input| input["p"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![9, 5, 3]);
}

#[tokio::test]
async fn test_failing_task_dead_letters_after_budget() {
    let fx = default_fixture().await;
    let orch = &fx.orchestrator;
    register(orch, "alpha", &["search"]).await;
    let outcome = orch
        .dispatch("acme", DispatchRequest::new("search", json!({})).with_max_retries(3))
        .await
        .unwrap();

    let executor = FailingExecutor::default();
    let mut reports = Vec::new();
    for _ in 0..4 {
        reports.push(orch.process_batch("acme", &executor, None).await.unwrap());
    }
    assert_eq!(reports.iter().map(|r| r.retried).sum::<usize>(), 3);
    assert_eq!(reports[3].dead_lettered, 1);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 4);

    let dead = orch.queue().peek(QueueType::DeadLetter, "acme", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, outcome.message_id);
    assert_eq!(dead[0].retry_count, 4);

    // Nothing left to run; the dead letter never returns to the task queue.
    let idle = orch.process_batch("acme", &executor, None).await.unwrap();
    assert_eq!(idle.total(), 0);

    let status = orch.status().await.unwrap();
    assert!(status.degraded);
    assert_eq!(status.dead_letters.get("acme"), Some(&1));
}

#[tokio::test]
async fn test_open_breaker_defers_remaining_tasks() {
    let fx = fixture(
        RateLimitConfig::default(),
        CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        },
    )
    .await;
    let orch = &fx.orchestrator;
    register(orch, "alpha", &["search"]).await;
    for _ in 0..3 {
        orch.dispatch("acme", DispatchRequest::new("search", json!({})))
            .await
            .unwrap();
    }

    let executor = FailingExecutor::default();
    let report = orch.process_batch("acme", &executor, None).await.unwrap();
    assert_eq!(report.retried, 2);
    assert_eq!(report.deferred, 1);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);

    // The deferred task kept its retry budget.
    let queued = orch.queue().peek(QueueType::Tasks, "acme", 10).await.unwrap();
    assert_eq!(queued.len(), 3);
    assert_eq!(queued.iter().filter(|m| m.retry_count == 0).count(), 1);

    let status = orch.status().await.unwrap();
    assert!(status.degraded);
    assert_eq!(status.open_breakers, vec!["alpha".to_string()]);
}

// ---------------------------------------------------------------------------
// Admission at dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_tenant_throttling_is_backpressure() {
    let fx = fixture(
        RateLimitConfig {
            capacity: 2.0,
            burst: 0.0,
            refill_per_sec: 0.0,
            poll_interval_ms: 10,
        },
        CircuitBreakerConfig::default(),
    )
    .await;
    let orch = &fx.orchestrator;
    register(orch, "alpha", &["search"]).await;

    for _ in 0..2 {
        orch.dispatch("acme", DispatchRequest::new("search", json!({})))
            .await
            .unwrap();
    }
    let err = orch
        .dispatch("acme", DispatchRequest::new("search", json!({})))
        .await
        .unwrap_err();
    assert!(err.is_backpressure());

    // Another tenant has its own bucket.
    orch.dispatch("globex", DispatchRequest::new("search", json!({})))
        .await
        .unwrap();
    assert!(orch.status().await.unwrap().open_breakers.is_empty());
}

#[tokio::test]
async fn test_store_outage_opens_queue_breaker() {
    let fx = fixture(
        RateLimitConfig::default(),
        CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        },
    )
    .await;
    let orch = &fx.orchestrator;
    register(orch, "alpha", &["search"]).await;
    fx.store.set_offline(true);

    for _ in 0..2 {
        let err = orch
            .dispatch("acme", DispatchRequest::new("search", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::QueueUnavailable(_)));
    }
    let err = orch
        .dispatch("acme", DispatchRequest::new("search", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::CircuitOpen(ref name) if name == QUEUE_BREAKER));
    assert_eq!(orch.directory().get("alpha").await.unwrap().message_count, 0);
}

#[tokio::test]
async fn test_offline_agents_are_not_selected() {
    let fx = default_fixture().await;
    let orch = &fx.orchestrator;
    register(orch, "alpha", &["search"]).await;
    orch.directory()
        .update_status("alpha", AgentStatus::Offline)
        .await
        .unwrap();

    let err = orch
        .dispatch("acme", DispatchRequest::new("search", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NoEligibleAgent(_)));

    orch.directory().heartbeat("alpha").await.unwrap();
    orch.dispatch("acme", DispatchRequest::new("search", json!({})))
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Store timeouts
// ---------------------------------------------------------------------------

/// A store whose every call outlives the queue's deadline.
struct StalledStore;

#[async_trait]
impl SortedStore for StalledStore {
    async fn next_sequence(&self, _key: &str) -> FleetResult<u64> {
        Ok(0)
    }
    async fn insert(&self, _key: &str, _member: String, _score: Score) -> FleetResult<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
    async fn top(&self, _key: &str, _n: usize) -> FleetResult<Vec<String>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
    async fn pop_top(&self, _key: &str, _n: usize) -> FleetResult<Vec<String>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
    async fn remove(&self, _key: &str, _member: &str) -> FleetResult<bool> {
        Ok(false)
    }
    async fn len(&self, _key: &str) -> FleetResult<usize> {
        Ok(0)
    }
    async fn clear(&self, _key: &str) -> FleetResult<usize> {
        Ok(0)
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_store_times_out() {
    let queue = TaskQueue::new(Arc::new(StalledStore), QueueConfig::default());
    let message = Message::task("acme", &TaskPayload::new("search", json!({}))).unwrap();

    let err = queue.publish(QueueType::Tasks, &message).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::StoreTimeout { ref operation, timeout_ms: 2000 } if operation == "insert"
    ));
    assert!(err.is_transient());

    let err = queue.consume(QueueType::Tasks, "acme", 5).await.unwrap_err();
    assert!(matches!(err, FleetError::StoreTimeout { .. }));
}

// ---------------------------------------------------------------------------
// Store blips
// ---------------------------------------------------------------------------

/// Delegates to an in-memory store but rejects the next insert whose key
/// starts with the armed prefix.
#[derive(Default)]
struct BlipStore {
    inner: InMemorySortedStore,
    armed: std::sync::Mutex<Option<String>>,
}

impl BlipStore {
    fn fail_next_insert(&self, key_prefix: &str) {
        *self.armed.lock().unwrap() = Some(key_prefix.to_string());
    }
}

#[async_trait]
impl SortedStore for BlipStore {
    async fn next_sequence(&self, key: &str) -> FleetResult<u64> {
        self.inner.next_sequence(key).await
    }
    async fn insert(&self, key: &str, member: String, score: Score) -> FleetResult<()> {
        let hit = {
            let mut armed = self.armed.lock().unwrap();
            match armed.as_deref() {
                Some(prefix) if key.starts_with(prefix) => armed.take().is_some(),
                _ => false,
            }
        };
        if hit {
            return Err(FleetError::QueueUnavailable("connection reset".into()));
        }
        self.inner.insert(key, member, score).await
    }
    async fn top(&self, key: &str, n: usize) -> FleetResult<Vec<String>> {
        self.inner.top(key, n).await
    }
    async fn pop_top(&self, key: &str, n: usize) -> FleetResult<Vec<String>> {
        self.inner.pop_top(key, n).await
    }
    async fn remove(&self, key: &str, member: &str) -> FleetResult<bool> {
        self.inner.remove(key, member).await
    }
    async fn len(&self, key: &str) -> FleetResult<usize> {
        self.inner.len(key).await
    }
    async fn clear(&self, key: &str) -> FleetResult<usize> {
        self.inner.clear(key).await
    }
}

async fn blip_orchestrator(store: Arc<BlipStore>) -> Orchestrator {
    let checkpoints = CheckpointStore::open(
        Arc::new(MemoryBlobStore::new()),
        Arc::new(MemoryIndexStore::new()),
        CheckpointOptions::default(),
    )
    .await
    .unwrap();
    Orchestrator::new(
        Arc::new(TaskQueue::new(store, QueueConfig::default())),
        Arc::new(AdmissionController::new(
            RateLimitConfig::default(),
            CircuitBreakerConfig::default(),
        )),
        Arc::new(AgentDirectory::new(DirectoryConfig::default())),
        Arc::new(checkpoints),
    )
}

#[tokio::test]
async fn test_result_publish_failure_restores_batch() {
    let store = Arc::new(BlipStore::default());
    let orch = blip_orchestrator(Arc::clone(&store)).await;
    register(&orch, "alpha", &["search"]).await;
    for i in 0..3 {
        orch.dispatch("acme", DispatchRequest::new("search", json!({"n": i})))
            .await
            .unwrap();
    }

    store.fail_next_insert("queue:results:");
    let err = orch.process_batch("acme", &EchoExecutor, None).await.unwrap_err();
    assert!(matches!(err, FleetError::QueueUnavailable(_)));
    assert_eq!(orch.queue().queue_size(QueueType::Tasks, "acme").await.unwrap(), 3);
    assert_eq!(orch.queue().queue_size(QueueType::Results, "acme").await.unwrap(), 0);
    let queued = orch.queue().peek(QueueType::Tasks, "acme", 10).await.unwrap();
    assert!(queued.iter().all(|m| m.retry_count == 0));

    // The store is back; the next batch finishes everything.
    let report = orch.process_batch("acme", &EchoExecutor, None).await.unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(orch.queue().queue_size(QueueType::Results, "acme").await.unwrap(), 3);
}

#[tokio::test]
async fn test_retry_failure_restores_batch() {
    let store = Arc::new(BlipStore::default());
    let orch = blip_orchestrator(Arc::clone(&store)).await;
    register(&orch, "alpha", &["search"]).await;
    for _ in 0..2 {
        orch.dispatch("acme", DispatchRequest::new("search", json!({})))
            .await
            .unwrap();
    }

    store.fail_next_insert("queue:tasks:");
    let executor = FailingExecutor::default();
    orch.process_batch("acme", &executor, None).await.unwrap_err();
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    let queued = orch.queue().peek(QueueType::Tasks, "acme", 10).await.unwrap();
    assert_eq!(queued.len(), 2);
    assert!(queued.iter().all(|m| m.retry_count == 0));
}

#[tokio::test]
async fn test_consumer_restores_batch_when_retry_fails() {
    let store = Arc::new(BlipStore::default());
    let queue = TaskQueue::new(store.clone(), QueueConfig::default());
    let mut ids = Vec::new();
    for i in 0..3 {
        let m = Message::task("acme", &TaskPayload::new("search", json!({"i": i}))).unwrap();
        ids.push(m.id);
        queue.publish(QueueType::Tasks, &m).await.unwrap();
    }

    store.fail_next_insert("queue:tasks:");
    let cancel = CancellationToken::new();
    let handler = {
        let cancel = cancel.clone();
        handler_fn(move |_m: Message| {
            let cancel = cancel.clone();
            async move {
                cancel.cancel();
                Err::<(), _>(FleetError::Handler("boom".into()))
            }
        })
    };

    let stats = queue
        .run_consumer(QueueType::Tasks, "acme", 10, handler.as_ref(), &cancel)
        .await
        .unwrap();
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.restored, 3);
    let mut back: Vec<_> = queue
        .peek(QueueType::Tasks, "acme", 10)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    back.sort();
    ids.sort();
    assert_eq!(back, ids);
}

/// Deregisters an agent as a side effect of the first insert.
struct DeregisteringStore {
    inner: InMemorySortedStore,
    directory: Arc<AgentDirectory>,
    agent: &'static str,
}

#[async_trait]
impl SortedStore for DeregisteringStore {
    async fn next_sequence(&self, key: &str) -> FleetResult<u64> {
        self.inner.next_sequence(key).await
    }
    async fn insert(&self, key: &str, member: String, score: Score) -> FleetResult<()> {
        self.directory.deregister(self.agent).await;
        self.inner.insert(key, member, score).await
    }
    async fn top(&self, key: &str, n: usize) -> FleetResult<Vec<String>> {
        self.inner.top(key, n).await
    }
    async fn pop_top(&self, key: &str, n: usize) -> FleetResult<Vec<String>> {
        self.inner.pop_top(key, n).await
    }
    async fn remove(&self, key: &str, member: &str) -> FleetResult<bool> {
        self.inner.remove(key, member).await
    }
    async fn len(&self, key: &str) -> FleetResult<usize> {
        self.inner.len(key).await
    }
    async fn clear(&self, key: &str) -> FleetResult<usize> {
        self.inner.clear(key).await
    }
}

#[tokio::test]
async fn test_dispatch_succeeds_when_agent_leaves_mid_publish() {
    let directory = Arc::new(AgentDirectory::new(DirectoryConfig::default()));
    directory
        .register("alpha", "worker", ["search"], Map::new())
        .await
        .unwrap();
    let store = DeregisteringStore {
        inner: InMemorySortedStore::new(),
        directory: Arc::clone(&directory),
        agent: "alpha",
    };
    let checkpoints = CheckpointStore::open(
        Arc::new(MemoryBlobStore::new()),
        Arc::new(MemoryIndexStore::new()),
        CheckpointOptions::default(),
    )
    .await
    .unwrap();
    let orch = Orchestrator::new(
        Arc::new(TaskQueue::new(Arc::new(store), QueueConfig::default())),
        Arc::new(AdmissionController::new(
            RateLimitConfig::default(),
            CircuitBreakerConfig::default(),
        )),
        Arc::clone(&directory),
        Arc::new(checkpoints),
    );

    let outcome = orch
        .dispatch("acme", DispatchRequest::new("search", json!({})))
        .await
        .unwrap();
    assert_eq!(outcome.agent, "alpha");
    assert!(orch.directory().get("alpha").await.is_none());
    assert_eq!(orch.queue().queue_size(QueueType::Tasks, "acme").await.unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Consumers and subscribers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_consumer_restores_unprocessed_on_cancel() {
    let queue = TaskQueue::in_memory(QueueConfig::default());
    for i in 0..5 {
        let m = Message::task("acme", &TaskPayload::new("search", json!({"i": i}))).unwrap();
        queue.publish(QueueType::Tasks, &m).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let handler = {
        let cancel = cancel.clone();
        let seen = Arc::clone(&seen);
        handler_fn(move |_m: Message| {
            let cancel = cancel.clone();
            let seen = Arc::clone(&seen);
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                    cancel.cancel();
                }
                Ok::<(), FleetError>(())
            }
        })
    };

    let stats = queue
        .run_consumer(QueueType::Tasks, "acme", 10, handler.as_ref(), &cancel)
        .await
        .unwrap();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.restored, 3);
    assert_eq!(queue.queue_size(QueueType::Tasks, "acme").await.unwrap(), 3);
}

#[tokio::test]
async fn test_consumer_interrupts_stuck_handler() {
    let queue = Arc::new(TaskQueue::in_memory(QueueConfig::default()));
    let m = Message::task("acme", &TaskPayload::new("search", json!({}))).unwrap();
    queue.publish(QueueType::Tasks, &m).await.unwrap();

    let cancel = CancellationToken::new();
    let consumer = {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let handler = handler_fn(|_m: Message| async {
                std::future::pending::<()>().await;
                Ok::<(), FleetError>(())
            });
            queue
                .run_consumer(QueueType::Tasks, "acme", 1, handler.as_ref(), &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let stats = consumer.await.unwrap().unwrap();
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.restored, 1);
    let back = queue.peek(QueueType::Tasks, "acme", 1).await.unwrap();
    assert_eq!(back[0].id, m.id);
    assert_eq!(back[0].retry_count, 0);
}

#[tokio::test]
async fn test_failing_subscriber_routes_into_retry() {
    let queue = Arc::new(TaskQueue::in_memory(QueueConfig::default()));
    let attempts = Arc::new(AtomicUsize::new(0));
    let sub = {
        let attempts = Arc::clone(&attempts);
        queue.subscribe(
            QueueType::Tasks,
            handler_fn(move |_m: Message| {
                let attempts = Arc::clone(&attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FleetError::Handler("boom".into()))
                }
            }),
        )
    };

    let m = Message::task("acme", &TaskPayload::new("search", json!({})))
        .unwrap()
        .with_max_retries(1);
    queue.publish(QueueType::Tasks, &m).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while queue.queue_size(QueueType::DeadLetter, "acme").await.unwrap() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "message never dead-lettered");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let dead = queue.peek(QueueType::DeadLetter, "acme", 1).await.unwrap();
    assert_eq!(dead[0].retry_count, 2);
    sub.shutdown().await;
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_progress_checkpoints_survive_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let config = fleet_core::FleetConfig {
        data_dir: tmp.path().to_path_buf(),
        ..fleet_core::FleetConfig::default()
    };

    {
        let orch = Orchestrator::from_config(&config).await.unwrap();
        register(&orch, "alpha", &["search"]).await;
        for i in 0..4 {
            orch.dispatch("acme", DispatchRequest::new("search", json!({"i": i})))
                .await
                .unwrap();
        }
        let checkpointer =
            AutoCheckpointer::new(Arc::clone(orch.checkpoints()), "alpha", "batch-acme", 2);
        let report = orch
            .process_batch("acme", &EchoExecutor, Some(&checkpointer))
            .await
            .unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.checkpoints, 2);
    }

    let orch = Orchestrator::from_config(&config).await.unwrap();
    let state = orch.recover("alpha", "batch-acme").await.unwrap().unwrap();
    assert_eq!(state["processed"], 4);
    assert_eq!(state["tenant"], "acme");
}
