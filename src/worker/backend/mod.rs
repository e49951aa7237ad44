//! Queue backends
//!
//! A backend is a durable store of [`TaskMessage`]s with claim semantics:
//! a dequeued task is invisible to other workers until it is completed,
//! retried, archived, or its lease runs out.
//!
//! Every dequeue stamps a fresh `claim` token. `complete`, `retry`,
//! `archive` and `extend_lease` only act while that token is current and
//! fail with [`QueueError::LeaseLost`] once another worker has re-claimed
//! the task.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::error::QueueError;
use super::task::TaskMessage;

pub use memory::MemoryQueue;
pub use postgres::PgQueue;

#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// How long a claim stays valid without renewal
    fn lease(&self) -> Duration;

    async fn enqueue(&self, msg: TaskMessage) -> Result<(), QueueError>;

    /// Claim the oldest ready task of `queue`, if any
    async fn dequeue(&self, queue: &str) -> Result<Option<TaskMessage>, QueueError>;

    /// Push the lease of a held claim out by another full lease
    async fn extend_lease(&self, msg: &TaskMessage) -> Result<(), QueueError>;

    /// Success: the task is removed
    async fn complete(&self, msg: &TaskMessage) -> Result<(), QueueError>;

    /// Release for another attempt at `process_at`, counting this one as failed
    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError>;

    /// Park as failed-permanent, kept for manual inspection
    async fn archive(&self, msg: &TaskMessage, error: &str) -> Result<(), QueueError>;
}
