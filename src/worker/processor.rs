//! Task Processor
//!
//! Pulls tasks from named queues and dispatches them by kind to registered
//! handlers.
//!
//! # Queue Priority
//!
//! Each poll visits the queues in a weighted random order: with weights
//! `critical: 10, default: 5` the critical queue is tried first two times out
//! of three. Lower-weight queues are never starved.
//!
//! # Retry
//!
//! ```text
//! ENQUEUED → IN_PROGRESS → SUCCEEDED
//!                ↓
//!          FAILED_RETRY (delay = min(base * 2^(n-1), max)) → ENQUEUED
//!                ↓ budget exhausted / SkipRetry
//!          FAILED_PERMANENT (archived, logged)
//! ```
//!
//! # Leases
//!
//! While a handler runs, the claim is renewed every third of the backend
//! lease. If the backend reports the claim as lost, the handler is dropped
//! and no terminal event is emitted: the task belongs to another worker.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::backend::QueueBackend;
use super::error::{ProcessorError, QueueError, TaskError};
use super::observer::{TaskEvent, TaskObserver};
use super::task::{QUEUE_CRITICAL, QUEUE_DEFAULT, Task, TaskKind, TaskMessage, TaskState};

#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: Task) -> Result<(), TaskError>;
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Queue name and relative weight
    pub queues: Vec<(String, u32)>,
    /// Number of worker loops
    pub concurrency: usize,
    /// Sleep between polls when every queue is empty
    pub poll_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queues: vec![
                (QUEUE_CRITICAL.to_string(), 10),
                (QUEUE_DEFAULT.to_string(), 5),
            ],
            concurrency: 10,
            poll_interval: Duration::from_secs(1),
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(600),
        }
    }
}

/// Floor on the lease renewal period
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

/// Delay before the attempt following the `attempt`-th failure
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp)
        .map_or(max, |delay| delay.min(max))
}

pub struct TaskProcessor {
    backend: Arc<dyn QueueBackend>,
    observer: Arc<dyn TaskObserver>,
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
    config: ProcessorConfig,
}

impl TaskProcessor {
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        observer: Arc<dyn TaskObserver>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            backend,
            observer,
            handlers: HashMap::new(),
            config,
        }
    }

    pub fn register(
        &mut self,
        kind: TaskKind,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), ProcessorError> {
        if self.handlers.contains_key(&kind) {
            return Err(ProcessorError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Every task kind must have a handler and every queue a weight
    pub fn validate(&self) -> Result<(), ProcessorError> {
        if self.config.queues.is_empty() {
            return Err(ProcessorError::NoQueues);
        }
        if let Some((name, _)) = self.config.queues.iter().find(|(_, w)| *w == 0) {
            return Err(ProcessorError::ZeroWeight(name.clone()));
        }
        if let Some(kind) = TaskKind::ALL
            .into_iter()
            .find(|k| !self.handlers.contains_key(k))
        {
            return Err(ProcessorError::MissingHandler(kind));
        }
        Ok(())
    }

    /// Weighted random permutation of the configured queues
    pub fn queue_order<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        let mut remaining: Vec<&(String, u32)> = self.config.queues.iter().collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|(_, w)| u64::from(*w)).sum();
            let mut pick = if total == 0 { 0 } else { rng.gen_range(0..total) };
            let mut index = remaining.len() - 1;
            for (i, (_, weight)) in remaining.iter().enumerate() {
                if pick < u64::from(*weight) {
                    index = i;
                    break;
                }
                pick -= u64::from(*weight);
            }
            order.push(remaining.remove(index).0.clone());
        }
        order
    }

    /// Claim and run at most one task. Returns the terminal state reached by
    /// this attempt, or `None` when every queue was empty.
    pub async fn process_next(&self) -> Result<Option<TaskState>, QueueError> {
        let order = self.queue_order(&mut rand::thread_rng());
        for queue in order {
            if let Some(msg) = self.backend.dequeue(&queue).await? {
                return self.process(msg).await.map(Some);
            }
        }
        Ok(None)
    }

    async fn process(&self, msg: TaskMessage) -> Result<TaskState, QueueError> {
        let started = Instant::now();
        self.observer
            .on_event(&TaskEvent::new(&msg, TaskState::InProgress, Duration::ZERO));

        let outcome = match Task::decode(&msg.task_type, &msg.payload) {
            Ok(task) => match self.handlers.get(&task.kind()) {
                Some(handler) => self.hold_lease(&msg, handler.handle(task)).await?,
                None => Err(TaskError::SkipRetry(format!(
                    "no handler for {}",
                    msg.task_type
                ))),
            },
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                self.backend.complete(&msg).await?;
                self.observer
                    .on_event(&TaskEvent::new(&msg, TaskState::Succeeded, elapsed));
                Ok(TaskState::Succeeded)
            }
            Err(TaskError::Retry(reason)) if !msg.is_last_attempt() => {
                let delay = retry_delay(
                    msg.attempt(),
                    self.config.retry_base,
                    self.config.retry_max,
                );
                let process_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                self.backend.retry(&msg, process_at, &reason).await?;
                self.observer.on_event(
                    &TaskEvent::new(&msg, TaskState::FailedRetry, elapsed).with_error(&reason),
                );
                debug!(task_id = %msg.id, delay_ms = delay.as_millis() as u64, "task rescheduled");
                Ok(TaskState::FailedRetry)
            }
            Err(e) => {
                let reason = e.to_string();
                self.backend.archive(&msg, &reason).await?;
                self.observer.on_event(
                    &TaskEvent::new(&msg, TaskState::FailedPermanent, elapsed)
                        .with_error(&reason),
                );
                error!(
                    task_id = %msg.id,
                    task_type = %msg.task_type,
                    queue = %msg.queue,
                    attempts = msg.attempt(),
                    payload = %String::from_utf8_lossy(&msg.payload),
                    error = %reason,
                    "Task archived, needs manual intervention"
                );
                Ok(TaskState::FailedPermanent)
            }
        }
    }

    /// Drive `work` to completion while renewing the claim on `msg`.
    /// `work` is dropped as soon as the claim is lost.
    async fn hold_lease<F>(
        &self,
        msg: &TaskMessage,
        work: F,
    ) -> Result<Result<(), TaskError>, QueueError>
    where
        F: Future<Output = Result<(), TaskError>>,
    {
        let period = (self.backend.lease() / 3).max(MIN_RENEW_PERIOD);
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                outcome = &mut work => return Ok(outcome),
                _ = renew.tick() => match self.backend.extend_lease(msg).await {
                    Ok(()) => {}
                    Err(e @ QueueError::LeaseLost(_)) => {
                        warn!(
                            task_id = %msg.id,
                            attempt = msg.attempt(),
                            "Lease lost, abandoning task"
                        );
                        return Err(e);
                    }
                    Err(e) => warn!(task_id = %msg.id, error = %e, "Lease renewal failed"),
                },
            }
        }
    }

    /// Run worker loops until `shutdown` turns true (or its sender is
    /// dropped). In-flight tasks are finished before returning.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<(), ProcessorError> {
        self.validate()?;
        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            "Starting task processor"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrency.max(1) {
            let processor = self.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move { processor.worker_loop(worker_id, shutdown).await });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Task worker panicked");
            }
        }

        info!("Task processor stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(QueueError::LeaseLost(task_id)) => {
                    warn!(worker_id, %task_id, "Task claimed by another worker, result dropped");
                    false
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "Queue backend error");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!(worker_id, "Task worker exited");
    }
}
