// Workflow Queue - durable hand-off between change events and the execution engine

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use bizflow_shared::{EntityChangeEvent, ExecutionStatus};

use super::engine::{ExecutionEngine, ExecutionTask};
use super::store::StoreError;
use super::triggers::TriggerEvaluator;
use crate::config::QueueConfig;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),
    #[error("malformed task payload: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Broker(err.to_string())
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A task handed to a consumer. The receipt must be acked once the task
/// reached a terminal outcome; un-acked deliveries come back after the
/// visibility timeout.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task: ExecutionTask,
    pub receipt: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub in_flight: u64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Prepares whatever the broker needs before the first publish.
    async fn declare(&self) -> QueueResult<()>;
    async fn enqueue(&self, task: &ExecutionTask) -> QueueResult<()>;
    async fn dequeue(&self, visibility: Duration) -> QueueResult<Option<Delivery>>;
    async fn ack(&self, receipt: &str) -> QueueResult<()>;
    /// Returns deliveries whose lease ran out to the pending queue.
    async fn requeue_expired(&self) -> QueueResult<u64>;
    /// Drops every pending and in-flight task.
    async fn purge(&self) -> QueueResult<u64>;
    async fn depth(&self) -> QueueResult<QueueDepth>;
}

#[derive(Default)]
struct MemoryQueue {
    pending: VecDeque<ExecutionTask>,
    leased: HashMap<String, (ExecutionTask, Instant)>,
}

/// Process-local broker for tests and single-node runs without Redis.
#[derive(Default)]
pub struct MemoryBroker {
    queue: Mutex<MemoryQueue>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn enqueue(&self, task: &ExecutionTask) -> QueueResult<()> {
        self.queue.lock().await.pending.push_back(task.clone());
        Ok(())
    }

    async fn dequeue(&self, visibility: Duration) -> QueueResult<Option<Delivery>> {
        let mut queue = self.queue.lock().await;
        let Some(task) = queue.pending.pop_front() else {
            return Ok(None);
        };
        let receipt = Uuid::new_v4().to_string();
        queue
            .leased
            .insert(receipt.clone(), (task.clone(), Instant::now() + visibility));
        Ok(Some(Delivery { task, receipt }))
    }

    async fn ack(&self, receipt: &str) -> QueueResult<()> {
        self.queue.lock().await.leased.remove(receipt);
        Ok(())
    }

    async fn requeue_expired(&self) -> QueueResult<u64> {
        let mut queue = self.queue.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = queue
            .leased
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in &expired {
            if let Some((mut task, _)) = queue.leased.remove(receipt) {
                task.attempt += 1;
                queue.pending.push_front(task);
            }
        }
        Ok(expired.len() as u64)
    }

    async fn purge(&self) -> QueueResult<u64> {
        let mut queue = self.queue.lock().await;
        let dropped = (queue.pending.len() + queue.leased.len()) as u64;
        queue.pending.clear();
        queue.leased.clear();
        Ok(dropped)
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let queue = self.queue.lock().await;
        Ok(QueueDepth {
            pending: queue.pending.len() as u64,
            in_flight: queue.leased.len() as u64,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_flight: u64,
    pub processed: u64,
    pub failed: u64,
    pub workers: usize,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Everything a consumer needs; cloned into each worker task.
#[derive(Clone)]
struct Worker {
    broker: Arc<dyn Broker>,
    engine: Arc<ExecutionEngine>,
    counters: Arc<Counters>,
    visibility: Duration,
    poll_interval: Duration,
}

impl Worker {
    async fn run(self, index: usize, shutdown: CancellationToken) {
        tracing::debug!(worker = index, "Queue worker started");
        while !shutdown.is_cancelled() {
            match self.broker.dequeue(self.visibility).await {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = index, error = %e, "Dequeue failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        tracing::debug!(worker = index, "Queue worker stopped");
    }

    /// Runs one delivery to a terminal state. Not raced against shutdown:
    /// an accepted task always finishes.
    async fn process(&self, delivery: Delivery) {
        let task = &delivery.task;
        match self.engine.execute(task).await {
            Ok(execution) => {
                if execution.status == ExecutionStatus::Failed {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                self.ack(&delivery).await;
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    task_id = %task.task_id,
                    rule_id = %task.rule_id,
                    attempt = task.attempt,
                    error = %e,
                    "Execution interrupted, leaving task for redelivery"
                );
            }
            Err(e) => {
                tracing::error!(
                    task_id = %task.task_id,
                    rule_id = %task.rule_id,
                    error = %e,
                    "Execution could not run, dropping task"
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.ack(&delivery).await;
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(&delivery.receipt).await {
            tracing::warn!(task_id = %delivery.task.task_id, error = %e, "Ack failed; task may be redelivered");
        }
    }
}

/// Owns the consumer pool and the only asynchronous path into the engine.
pub struct QueueManager {
    broker: Arc<dyn Broker>,
    engine: Arc<ExecutionEngine>,
    evaluator: Arc<TriggerEvaluator>,
    config: QueueConfig,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl QueueManager {
    pub fn new(
        broker: Arc<dyn Broker>,
        engine: Arc<ExecutionEngine>,
        evaluator: Arc<TriggerEvaluator>,
        config: QueueConfig,
    ) -> Self {
        Self {
            broker,
            engine,
            evaluator,
            config,
            counters: Arc::new(Counters::default()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    pub async fn initialize(&self) -> QueueResult<()> {
        self.broker.declare().await?;
        tracing::info!(queue = %self.config.name, "Execution queue declared");
        Ok(())
    }

    /// Launches the worker pool and the lease reaper. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Queue manager already started");
            return;
        }

        let worker = Worker {
            broker: self.broker.clone(),
            engine: self.engine.clone(),
            counters: self.counters.clone(),
            visibility: self.config.visibility_timeout,
            poll_interval: self.config.poll_interval,
        };
        for index in 0..self.config.workers.max(1) {
            self.tracker
                .spawn(worker.clone().run(index, self.shutdown.clone()));
        }

        let broker = self.broker.clone();
        let shutdown = self.shutdown.clone();
        let every = (self.config.visibility_timeout / 4).max(self.config.poll_interval);
        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match broker.requeue_expired().await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(requeued = n, "Redelivering expired tasks"),
                        Err(e) => tracing::warn!(error = %e, "Lease reaper failed"),
                    },
                }
            }
        });

        tracing::info!(
            queue = %self.config.name,
            workers = self.config.workers,
            "Execution queue started"
        );
    }

    /// Stops taking new tasks and waits for in-flight executions to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!(queue = %self.config.name, "Execution queue stopped");
    }

    pub async fn clear_queue(&self) -> QueueResult<u64> {
        let dropped = self.broker.purge().await?;
        tracing::info!(queue = %self.config.name, dropped, "Execution queue cleared");
        Ok(dropped)
    }

    pub async fn publish(&self, task: ExecutionTask) -> QueueResult<Uuid> {
        self.broker.enqueue(&task).await?;
        tracing::debug!(task_id = %task.task_id, rule_id = %task.rule_id, "Published execution task");
        Ok(task.task_id)
    }

    /// Publishes one task per rule the event matches; returns the task ids.
    pub async fn enqueue_event(&self, event: &EntityChangeEvent) -> QueueResult<Vec<Uuid>> {
        let rules = self.evaluator.matching_rules(event).await?;
        let mut task_ids = Vec::with_capacity(rules.len());
        for rule in rules {
            task_ids.push(self.publish(ExecutionTask::new(rule.id, event.clone())).await?);
        }
        tracing::info!(
            event_id = %event.event_id,
            entity_id = %event.entity_id,
            tasks = task_ids.len(),
            "Enqueued change event"
        );
        Ok(task_ids)
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let depth = self.broker.depth().await?;
        Ok(QueueStats {
            pending: depth.pending,
            in_flight: depth.in_flight,
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            workers: self.config.workers,
        })
    }
}
