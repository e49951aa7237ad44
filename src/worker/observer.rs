//! Task transition reporting
//!
//! Distributor and processor report every transition to an injected
//! [`TaskObserver`]. Swap in [`NoopObserver`] or [`MemoryObserver`] in tests.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::task::{TaskId, TaskMessage, TaskState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub task_type: String,
    pub queue: String,
    /// Attempt the event refers to (0 for enqueue)
    pub attempt: u32,
    pub duration: Duration,
    pub outcome: TaskState,
    pub payload_digest: String,
    pub error: Option<String>,
}

impl TaskEvent {
    pub fn new(msg: &TaskMessage, outcome: TaskState, duration: Duration) -> Self {
        let attempt = match outcome {
            TaskState::Enqueued => msg.retried,
            _ => msg.attempt(),
        };
        Self {
            task_id: msg.id,
            task_type: msg.task_type.clone(),
            queue: msg.queue.clone(),
            attempt,
            duration,
            outcome,
            payload_digest: msg.payload_digest(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

pub trait TaskObserver: Send + Sync + 'static {
    fn on_event(&self, event: &TaskEvent);
}

/// Structured log sink
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TaskObserver for TracingObserver {
    fn on_event(&self, e: &TaskEvent) {
        let duration_ms = e.duration.as_millis() as u64;
        match e.outcome {
            TaskState::Enqueued => info!(
                task_id = %e.task_id,
                task_type = %e.task_type,
                queue = %e.queue,
                digest = %e.payload_digest,
                "enqueued task"
            ),
            TaskState::InProgress => debug!(
                task_id = %e.task_id,
                task_type = %e.task_type,
                queue = %e.queue,
                attempt = e.attempt,
                "started task"
            ),
            TaskState::Succeeded => info!(
                task_id = %e.task_id,
                task_type = %e.task_type,
                queue = %e.queue,
                attempt = e.attempt,
                duration_ms,
                "processed task"
            ),
            TaskState::FailedRetry => warn!(
                task_id = %e.task_id,
                task_type = %e.task_type,
                queue = %e.queue,
                attempt = e.attempt,
                duration_ms,
                error = e.error.as_deref().unwrap_or_default(),
                "task failed, will retry"
            ),
            TaskState::FailedPermanent => error!(
                task_id = %e.task_id,
                task_type = %e.task_type,
                queue = %e.queue,
                attempt = e.attempt,
                duration_ms,
                digest = %e.payload_digest,
                error = e.error.as_deref().unwrap_or_default(),
                "task failed permanently"
            ),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TaskObserver for NoopObserver {
    fn on_event(&self, _event: &TaskEvent) {}
}

/// Records every event
#[derive(Debug, Default)]
pub struct MemoryObserver {
    events: Mutex<Vec<TaskEvent>>,
}

impl MemoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, outcome: TaskState) -> usize {
        self.events().iter().filter(|e| e.outcome == outcome).count()
    }
}

impl TaskObserver for MemoryObserver {
    fn on_event(&self, event: &TaskEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
