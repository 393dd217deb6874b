use crate::sorted_store::{InMemorySortedStore, Score, SortedStore};
use async_trait::async_trait;
use fleet_core::{FleetError, FleetResult, Message, QueueConfig, QueueType};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ALL_QUEUES: [QueueType; 4] = [
    QueueType::Tasks,
    QueueType::Results,
    QueueType::Events,
    QueueType::DeadLetter,
];

/// Processes one delivered message. An `Err` sends the message through
/// [`TaskQueue::retry`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message.
    async fn handle(&self, message: &Message) -> FleetResult<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = FleetResult<()>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> FleetResult<()> {
        (self.0)(message.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = FleetResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// What [`TaskQueue::retry`] did with a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// Back on its original queue with a decayed priority.
    Requeued {
        /// Attempts failed so far.
        retry_count: u32,
        /// Priority after decay.
        priority: u8,
    },
    /// Retry budget exhausted; now on the tenant's dead-letter queue.
    DeadLettered {
        /// Attempts failed, one past the budget.
        retry_count: u32,
    },
}

/// Counters reported by [`TaskQueue::run_consumer`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    /// Messages the handler accepted.
    pub processed: u64,
    /// Failures requeued with a decayed priority.
    pub retried: u64,
    /// Failures moved to the dead-letter queue.
    pub dead_lettered: u64,
    /// Messages put back untouched, on cancellation or after a store error.
    pub restored: u64,
}

/// Handle to a running subscriber task. Dropping it cancels the task.
pub struct Subscription {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Ask the subscriber task to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for the subscriber task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Multi-tenant priority queue with retry and dead-letter handling.
///
/// Every `(queue type, tenant)` pair is an independent sorted set in the
/// backing store, ordered by priority descending and then by the publish
/// sequence. Publishes are also broadcast in-process to subscribers of the
/// queue type, across tenants. Sequence numbers come from the store, so
/// several queues may share one store.
pub struct TaskQueue {
    store: Arc<dyn SortedStore>,
    channels: HashMap<QueueType, broadcast::Sender<Message>>,
    config: QueueConfig,
}

impl TaskQueue {
    /// Queue over `store`.
    pub fn new(store: Arc<dyn SortedStore>, config: QueueConfig) -> Self {
        let capacity = config.broadcast_capacity.max(1);
        let channels = ALL_QUEUES
            .into_iter()
            .map(|queue| (queue, broadcast::channel(capacity).0))
            .collect();
        Self {
            store,
            channels,
            config,
        }
    }

    /// Queue over a fresh [`InMemorySortedStore`].
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(Arc::new(InMemorySortedStore::new()), config)
    }

    /// Queue settings.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Validate and enqueue `message`, then notify subscribers of `queue`.
    ///
    /// Each publish takes a fresh sequence number, so a republished message
    /// goes behind others of equal priority.
    pub async fn publish(&self, queue: QueueType, message: &Message) -> FleetResult<()> {
        self.insert(queue, message).await?;
        if let Some(tx) = self.channels.get(&queue) {
            // No receivers is fine.
            let _ = tx.send(message.clone());
        }
        debug!(
            queue = %queue,
            tenant = %message.tenant_id,
            message_id = %message.id,
            priority = message.priority,
            "message published"
        );
        Ok(())
    }

    /// Put a message back without counting a retry or notifying subscribers.
    pub async fn requeue(&self, queue: QueueType, message: &Message) -> FleetResult<()> {
        self.insert(queue, message).await?;
        debug!(queue = %queue, message_id = %message.id, "message restored");
        Ok(())
    }

    /// [`requeue`](Self::requeue) every message, carrying on past failures.
    /// Returns how many made it back; the rest are logged as lost.
    pub async fn restore(&self, queue: QueueType, messages: impl IntoIterator<Item = Message>) -> u64 {
        let mut restored = 0;
        for message in messages {
            match self.requeue(queue, &message).await {
                Ok(()) => restored += 1,
                Err(e) => error!(
                    queue = %queue,
                    tenant = %message.tenant_id,
                    message_id = %message.id,
                    error = %e,
                    "message could not be restored and is lost"
                ),
            }
        }
        restored
    }

    /// Pop up to `batch_size` messages in priority order.
    ///
    /// Delivery is at-least-once: once popped, a message is the caller's to
    /// finish, retry, or requeue.
    pub async fn consume(
        &self,
        queue: QueueType,
        tenant_id: &str,
        batch_size: usize,
    ) -> FleetResult<Vec<Message>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let key = queue.key(tenant_id);
        let members = self
            .with_timeout("pop_top", self.store.pop_top(&key, batch_size))
            .await?;
        Ok(decode_members(&key, members))
    }

    /// The next `n` messages without removing them.
    pub async fn peek(&self, queue: QueueType, tenant_id: &str, n: usize) -> FleetResult<Vec<Message>> {
        let key = queue.key(tenant_id);
        let members = self.with_timeout("top", self.store.top(&key, n)).await?;
        Ok(decode_members(&key, members))
    }

    /// Record a failed attempt.
    ///
    /// The retry count goes up by one. Past `max_retries` the message moves to
    /// the tenant's dead-letter queue as is; otherwise its priority drops by
    /// one (never below the minimum) and it is republished to `queue`.
    pub async fn retry(&self, queue: QueueType, mut message: Message) -> FleetResult<RetryOutcome> {
        message.retry_count += 1;
        if message.retries_exhausted() {
            self.publish(QueueType::DeadLetter, &message).await?;
            warn!(
                queue = %queue,
                tenant = %message.tenant_id,
                message_id = %message.id,
                retry_count = message.retry_count,
                "message dead-lettered"
            );
            return Ok(RetryOutcome::DeadLettered {
                retry_count: message.retry_count,
            });
        }

        message.decay_priority();
        self.publish(queue, &message).await?;
        debug!(
            queue = %queue,
            message_id = %message.id,
            retry_count = message.retry_count,
            priority = message.priority,
            "message requeued for retry"
        );
        Ok(RetryOutcome::Requeued {
            retry_count: message.retry_count,
            priority: message.priority,
        })
    }

    /// Move one dead letter back to `target` with a fresh retry budget.
    /// Returns `false` when no dead letter has that id.
    pub async fn replay_dead_letter(
        &self,
        tenant_id: &str,
        message_id: Uuid,
        target: QueueType,
    ) -> FleetResult<bool> {
        let key = QueueType::DeadLetter.key(tenant_id);
        let size = self.with_timeout("len", self.store.len(&key)).await?;
        let members = self.with_timeout("top", self.store.top(&key, size)).await?;

        let found = members.into_iter().find_map(|raw| {
            let message = Message::from_wire(&raw).ok()?;
            (message.id == message_id).then_some((raw, message))
        });
        let Some((raw, mut message)) = found else {
            return Ok(false);
        };

        if !self.with_timeout("remove", self.store.remove(&key, &raw)).await? {
            // Someone else replayed it first.
            return Ok(false);
        }
        message.retry_count = 0;
        self.publish(target, &message).await?;
        info!(tenant = tenant_id, message_id = %message_id, target = %target, "dead letter replayed");
        Ok(true)
    }

    /// Number of messages waiting in the queue.
    pub async fn queue_size(&self, queue: QueueType, tenant_id: &str) -> FleetResult<usize> {
        let key = queue.key(tenant_id);
        self.with_timeout("len", self.store.len(&key)).await
    }

    /// Drop every message in the queue, returning how many were removed.
    pub async fn clear_queue(&self, queue: QueueType, tenant_id: &str) -> FleetResult<usize> {
        let key = queue.key(tenant_id);
        let cleared = self.with_timeout("clear", self.store.clear(&key)).await?;
        info!(queue = %queue, tenant = tenant_id, cleared, "queue cleared");
        Ok(cleared)
    }

    /// Run `handler` on every message published to `queue` from now on, for
    /// all tenants. Handler failures go through [`retry`](Self::retry).
    pub fn subscribe(self: &Arc<Self>, queue: QueueType, handler: Arc<dyn MessageHandler>) -> Subscription {
        let cancel = CancellationToken::new();
        let Some(tx) = self.channels.get(&queue) else {
            cancel.cancel();
            return Subscription { cancel, handle: None };
        };
        let mut rx = tx.subscribe();
        let this = Arc::clone(self);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(message) => message,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(queue = %queue, skipped, "subscriber lagged, notifications dropped");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if let Err(e) = handler.handle(&message).await {
                    debug!(queue = %queue, message_id = %message.id, error = %e, "subscriber handler failed");
                    if let Err(retry_err) = this.retry(queue, message).await {
                        warn!(queue = %queue, error = %retry_err, "retry after handler failure failed");
                    }
                }
            }
            debug!(queue = %queue, "subscriber stopped");
        });

        Subscription {
            cancel,
            handle: Some(handle),
        }
    }

    /// Poll `queue` for `tenant_id` and process batches until `cancel` fires.
    ///
    /// Messages popped but not yet handled when cancellation arrives are
    /// restored to the queue untouched. If recording a failure hits the store,
    /// the failed message and the rest of its batch are restored as well.
    /// Transient store errors back off for one idle poll; any other store
    /// error ends the loop.
    pub async fn run_consumer(
        &self,
        queue: QueueType,
        tenant_id: &str,
        batch_size: usize,
        handler: &dyn MessageHandler,
        cancel: &CancellationToken,
    ) -> FleetResult<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        info!(queue = %queue, tenant = tenant_id, batch_size, "consumer started");

        while !cancel.is_cancelled() {
            let batch = match self.consume(queue, tenant_id, batch_size).await {
                Ok(batch) => batch,
                Err(e) if e.is_transient() => {
                    warn!(queue = %queue, tenant = tenant_id, error = %e, "consume failed, backing off");
                    self.idle(cancel).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if batch.is_empty() {
                self.idle(cancel).await;
                continue;
            }

            let mut pending = batch.into_iter();
            while let Some(message) = pending.next() {
                let outcome = if cancel.is_cancelled() {
                    None
                } else {
                    tokio::select! {
                        biased;
                        result = handler.handle(&message) => Some(result),
                        _ = cancel.cancelled() => None,
                    }
                };
                match outcome {
                    None => {
                        let rest = std::iter::once(message).chain(pending.by_ref());
                        stats.restored += self.restore(queue, rest).await;
                    }
                    Some(Ok(())) => stats.processed += 1,
                    Some(Err(e)) => {
                        debug!(message_id = %message.id, error = %e, "handler failed");
                        match self.retry(queue, message.clone()).await {
                            Ok(RetryOutcome::Requeued { .. }) => stats.retried += 1,
                            Ok(RetryOutcome::DeadLettered { .. }) => stats.dead_lettered += 1,
                            Err(store_err) => {
                                warn!(
                                    queue = %queue,
                                    tenant = tenant_id,
                                    error = %store_err,
                                    "retry failed, restoring batch"
                                );
                                let rest = std::iter::once(message).chain(pending.by_ref());
                                stats.restored += self.restore(queue, rest).await;
                                if !store_err.is_transient() {
                                    return Err(store_err);
                                }
                                self.idle(cancel).await;
                            }
                        }
                    }
                }
            }
        }

        info!(
            queue = %queue,
            tenant = tenant_id,
            processed = stats.processed,
            restored = stats.restored,
            "consumer stopped"
        );
        Ok(stats)
    }

    async fn idle(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.idle_poll()) => {}
        }
    }

    async fn insert(&self, queue: QueueType, message: &Message) -> FleetResult<()> {
        message.validate()?;
        let member = message.to_wire()?;
        let key = queue.key(&message.tenant_id);
        let sequence = self
            .with_timeout("next_sequence", self.store.next_sequence(&key))
            .await?;
        let score = Score {
            priority: message.priority,
            sequence,
        };
        self.with_timeout("insert", self.store.insert(&key, member, score))
            .await
    }

    async fn with_timeout<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = FleetResult<T>>,
    ) -> FleetResult<T> {
        match tokio::time::timeout(self.config.store_timeout(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(FleetError::Io(e))) => Err(FleetError::QueueUnavailable(e.to_string())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FleetError::StoreTimeout {
                operation: operation.to_string(),
                timeout_ms: self.config.store_timeout_ms,
            }),
        }
    }
}

fn decode_members(key: &str, members: Vec<String>) -> Vec<Message> {
    members
        .into_iter()
        .filter_map(|raw| match Message::from_wire(&raw) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(key, error = %e, "undecodable queue member dropped");
                None
            }
        })
        .collect()
}
