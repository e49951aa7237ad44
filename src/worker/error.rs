//! Task Queue Error Types

use thiserror::Error;

use super::task::{TaskId, TaskKind};
use crate::store::StoreError;

/// Queue backend / distributor failure
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Failed to serialize payload: {0}")]
    Serialization(String),

    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Invalid task options: {0}")]
    InvalidOptions(String),

    /// The claim was superseded: the lease ran out and another worker took the task
    #[error("Lease lost on task {0}")]
    LeaseLost(TaskId),
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Serialization(_) => "SERIALIZATION_ERROR",
            QueueError::Unavailable(_) => "QUEUE_UNAVAILABLE",
            QueueError::Backend(_) => "QUEUE_ERROR",
            QueueError::InvalidOptions(_) => "INVALID_OPTIONS",
            QueueError::LeaseLost(_) => "LEASE_LOST",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        match StoreError::from(e) {
            StoreError::Transient(msg) => QueueError::Unavailable(msg),
            other => QueueError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

/// Handler outcome on failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Try again after backoff while budget remains
    #[error("{0}")]
    Retry(String),

    /// Straight to failed-permanent (stale or malformed task)
    #[error("skip retry: {0}")]
    SkipRetry(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retry(_))
    }
}

/// Processor construction / startup failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("No handler registered for {0}")]
    MissingHandler(TaskKind),

    #[error("Handler already registered for {0}")]
    DuplicateHandler(TaskKind),

    #[error("No queues configured")]
    NoQueues,

    #[error("Queue {0} has zero weight")]
    ZeroWeight(String),
}
