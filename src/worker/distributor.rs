//! Task Distributor
//!
//! Serializes a task, writes it to the queue backend and reports the
//! enqueue. Never runs the task.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::backend::QueueBackend;
use super::error::QueueError;
use super::observer::{TaskEvent, TaskObserver};
use super::task::{PayloadSendVerifyEmail, Task, TaskInfo, TaskMessage, TaskOptions, TaskState};

#[async_trait]
pub trait TaskDistributor: Send + Sync + 'static {
    async fn distribute_task(&self, task: Task, opts: TaskOptions) -> Result<TaskInfo, QueueError>;

    async fn distribute_task_send_verify_email(
        &self,
        payload: PayloadSendVerifyEmail,
        opts: TaskOptions,
    ) -> Result<TaskInfo, QueueError> {
        self.distribute_task(Task::SendVerifyEmail(payload), opts)
            .await
    }
}

pub struct QueueDistributor {
    backend: Arc<dyn QueueBackend>,
    observer: Arc<dyn TaskObserver>,
}

impl QueueDistributor {
    pub fn new(backend: Arc<dyn QueueBackend>, observer: Arc<dyn TaskObserver>) -> Self {
        Self { backend, observer }
    }
}

#[async_trait]
impl TaskDistributor for QueueDistributor {
    async fn distribute_task(&self, task: Task, opts: TaskOptions) -> Result<TaskInfo, QueueError> {
        let msg = TaskMessage::new(&task, &opts, Utc::now())?;
        let info = msg.info();
        let event = TaskEvent::new(&msg, TaskState::Enqueued, Duration::ZERO);

        self.backend.enqueue(msg).await?;
        self.observer.on_event(&event);
        Ok(info)
    }
}
