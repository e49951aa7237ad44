//! Background task queue
//!
//! - [`distributor`] - enqueue side, never runs tasks
//! - [`processor`] - worker loops: weighted queue selection, retry with backoff
//! - [`backend`] - durable queue storage (PostgreSQL, in-memory)
//! - [`send_verify_email`] - the verification mail task
//! - [`outbox`] - redelivery of user events the after-create hook missed

pub mod backend;
pub mod distributor;
pub mod error;
pub mod observer;
pub mod outbox;
pub mod processor;
pub mod send_verify_email;
pub mod task;

pub use backend::{MemoryQueue, PgQueue, QueueBackend};
pub use distributor::{QueueDistributor, TaskDistributor};
pub use error::{ProcessorError, QueueError, TaskError};
pub use observer::{MemoryObserver, NoopObserver, TaskEvent, TaskObserver, TracingObserver};
pub use outbox::{OutboxRelay, RelayConfig};
pub use processor::{ProcessorConfig, TaskHandler, TaskProcessor, retry_delay};
pub use send_verify_email::{SendVerifyEmailHandler, enqueue_verify_email, verify_email_link};
pub use task::{
    PayloadSendVerifyEmail, QUEUE_CRITICAL, QUEUE_DEFAULT, TASK_SEND_VERIFY_EMAIL, Task, TaskId,
    TaskInfo, TaskKind, TaskMessage, TaskOptions, TaskState,
};
