//! Task model
//!
//! Task types form a closed union. Each variant has a type tag used on the
//! wire and a flat JSON payload; unknown payload fields are ignored so older
//! workers keep processing tasks written by newer producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::{QueueError, TaskError};

pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;

/// Task type without payload, the key handlers register under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    SendVerifyEmail,
}

impl TaskKind {
    pub const ALL: [TaskKind; 1] = [TaskKind::SendVerifyEmail];

    pub fn type_tag(&self) -> &'static str {
        match self {
            TaskKind::SendVerifyEmail => TASK_SEND_VERIFY_EMAIL,
        }
    }

    pub fn from_type_tag(tag: &str) -> Option<Self> {
        TaskKind::ALL.into_iter().find(|k| k.type_tag() == tag)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    SendVerifyEmail(PayloadSendVerifyEmail),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::SendVerifyEmail(_) => TaskKind::SendVerifyEmail,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        self.kind().type_tag()
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, QueueError> {
        let bytes = match self {
            Task::SendVerifyEmail(payload) => serde_json::to_vec(payload)?,
        };
        Ok(bytes)
    }

    /// Unknown tags and malformed payloads are not worth retrying
    pub fn decode(task_type: &str, payload: &[u8]) -> Result<Self, TaskError> {
        let kind = TaskKind::from_type_tag(task_type)
            .ok_or_else(|| TaskError::SkipRetry(format!("unknown task type {}", task_type)))?;
        let malformed =
            |e: serde_json::Error| TaskError::SkipRetry(format!("malformed {} payload: {}", kind, e));
        match kind {
            TaskKind::SendVerifyEmail => serde_json::from_slice(payload)
                .map(Task::SendVerifyEmail)
                .map_err(malformed),
        }
    }
}

/// Enqueue options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: String,
    /// Total attempts allowed, including the first
    pub max_attempts: u32,
    /// Minimum delay before the first attempt
    pub process_in: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            queue: QUEUE_DEFAULT.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            process_in: Duration::ZERO,
        }
    }
}

impl TaskOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = delay;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.queue.is_empty() {
            return Err(QueueError::InvalidOptions("queue name is empty".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::InvalidOptions(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Task ID - ULID, sortable by enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(ulid::Ulid);

impl TaskId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Task lifecycle states
///
/// Stored as SMALLINT. Succeeded tasks are deleted from the backend and
/// `FailedRetry` tasks go back to `Enqueued`, so only `Enqueued`,
/// `InProgress` and `FailedPermanent` are ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum TaskState {
    Enqueued = 0,
    InProgress = 10,
    Succeeded = 20,
    FailedRetry = -10,
    FailedPermanent = -20,
}

impl TaskState {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(TaskState::Enqueued),
            10 => Some(TaskState::InProgress),
            20 => Some(TaskState::Succeeded),
            -10 => Some(TaskState::FailedRetry),
            -20 => Some(TaskState::FailedPermanent),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::FailedPermanent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Enqueued => "ENQUEUED",
            TaskState::InProgress => "IN_PROGRESS",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::FailedRetry => "FAILED_RETRY",
            TaskState::FailedPermanent => "FAILED_PERMANENT",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A task as stored in the queue backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    /// Failed attempts so far
    pub retried: u32,
    pub max_attempts: u32,
    pub process_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Fencing token of the current claim, bumped by every dequeue.
    /// Zero until the task is first claimed.
    pub claim: u64,
}

impl TaskMessage {
    pub fn new(task: &Task, opts: &TaskOptions, now: DateTime<Utc>) -> Result<Self, QueueError> {
        opts.validate()?;
        let delay = chrono::Duration::from_std(opts.process_in)
            .map_err(|e| QueueError::InvalidOptions(format!("process_in: {}", e)))?;
        Ok(Self {
            id: TaskId::new(),
            task_type: task.type_tag().to_string(),
            payload: task.encode_payload()?,
            queue: opts.queue.clone(),
            retried: 0,
            max_attempts: opts.max_attempts,
            process_at: now + delay,
            last_error: None,
            claim: 0,
        })
    }

    /// 1-based number of the attempt being made now
    pub fn attempt(&self) -> u32 {
        self.retried + 1
    }

    /// Whether a failure of the current attempt exhausts the budget
    pub fn is_last_attempt(&self) -> bool {
        self.attempt() >= self.max_attempts
    }

    pub fn payload_digest(&self) -> String {
        payload_digest(&self.payload)
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            task_type: self.task_type.clone(),
            queue: self.queue.clone(),
            max_attempts: self.max_attempts,
            process_at: self.process_at,
        }
    }
}

/// Acceptance metadata returned by the distributor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub task_type: String,
    pub queue: String,
    pub max_attempts: u32,
    pub process_at: DateTime<Utc>,
}

/// md5 hex of the raw payload, safe to log
pub fn payload_digest(payload: &[u8]) -> String {
    format!("{:x}", md5::compute(payload))
}
