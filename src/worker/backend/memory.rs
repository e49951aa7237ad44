//! In-process queue backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::QueueBackend;
use crate::worker::error::QueueError;
use crate::worker::task::{TaskId, TaskMessage, TaskState};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Slot {
    msg: TaskMessage,
    state: TaskState,
    lease_until: Option<DateTime<Utc>>,
}

impl Slot {
    fn is_claimable(&self, queue: &str, now: DateTime<Utc>) -> bool {
        if self.msg.queue != queue || self.msg.process_at > now {
            return false;
        }
        match self.state {
            TaskState::Enqueued => true,
            TaskState::InProgress => self.lease_until.is_some_and(|until| until <= now),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, Slot>,
    archived: Vec<TaskMessage>,
}

#[derive(Debug)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    lease: Duration,
    unavailable: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }

    pub fn with_lease(lease: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lease,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail with `Unavailable` until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Tasks not yet completed or archived
    pub fn pending_len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn pending(&self) -> Vec<TaskMessage> {
        let mut tasks: Vec<_> = self.lock().tasks.values().map(|s| s.msg.clone()).collect();
        tasks.sort_by_key(|m| (m.process_at, m.id));
        tasks
    }

    pub fn archived(&self) -> Vec<TaskMessage> {
        self.lock().archived.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease).unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory queue switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn lease(&self) -> Duration {
        self.lease
    }

    async fn enqueue(&self, msg: TaskMessage) -> Result<(), QueueError> {
        self.check_available()?;
        let mut inner = self.lock();
        if inner.tasks.contains_key(&msg.id) {
            return Err(QueueError::Backend(format!("task {} already enqueued", msg.id)));
        }
        inner.tasks.insert(
            msg.id,
            Slot {
                msg,
                state: TaskState::Enqueued,
                lease_until: None,
            },
        );
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<TaskMessage>, QueueError> {
        self.check_available()?;
        let now = Utc::now();
        let lease = self.lease_delta();
        let mut inner = self.lock();

        let Some(slot) = inner
            .tasks
            .values_mut()
            .filter(|s| s.is_claimable(queue, now))
            .min_by_key(|s| (s.msg.process_at, s.msg.id))
        else {
            return Ok(None);
        };
        slot.state = TaskState::InProgress;
        slot.lease_until = Some(now + lease);
        slot.msg.claim += 1;
        Ok(Some(slot.msg.clone()))
    }

    async fn extend_lease(&self, msg: &TaskMessage) -> Result<(), QueueError> {
        self.check_available()?;
        let until = Utc::now() + self.lease_delta();
        let mut inner = self.lock();
        held(&mut inner, msg)?.lease_until = Some(until);
        Ok(())
    }

    async fn complete(&self, msg: &TaskMessage) -> Result<(), QueueError> {
        self.check_available()?;
        let mut inner = self.lock();
        held(&mut inner, msg)?;
        inner.tasks.remove(&msg.id);
        Ok(())
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        self.check_available()?;
        let mut inner = self.lock();
        let slot = held(&mut inner, msg)?;
        slot.msg.retried += 1;
        slot.msg.process_at = process_at;
        slot.msg.last_error = Some(error.to_string());
        slot.state = TaskState::Enqueued;
        slot.lease_until = None;
        Ok(())
    }

    async fn archive(&self, msg: &TaskMessage, error: &str) -> Result<(), QueueError> {
        self.check_available()?;
        let mut inner = self.lock();
        held(&mut inner, msg)?;
        let Some(mut slot) = inner.tasks.remove(&msg.id) else {
            return Err(QueueError::LeaseLost(msg.id));
        };
        slot.msg.retried += 1;
        slot.msg.last_error = Some(error.to_string());
        inner.archived.push(slot.msg);
        Ok(())
    }
}

/// The slot of `msg`, if `msg` still holds the current claim on it
fn held<'a>(inner: &'a mut Inner, msg: &TaskMessage) -> Result<&'a mut Slot, QueueError> {
    match inner.tasks.get_mut(&msg.id) {
        Some(slot) if slot.state == TaskState::InProgress && slot.msg.claim == msg.claim => {
            Ok(slot)
        }
        _ => Err(QueueError::LeaseLost(msg.id)),
    }
}
