//! Outbox Relay
//!
//! Background loop that turns `user_created` events nobody delivered (the
//! after-create hook failed or the process died before running it) into
//! send-verify-email tasks.
//!
//! Each event is handled in its own transaction: the publish mark takes the
//! event's row lock, the task is enqueued, and the mark commits only if the
//! enqueue succeeded. An event already marked by the hook or by another
//! relay is skipped.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::distributor::TaskDistributor;
use super::task::{PayloadSendVerifyEmail, Task, TaskOptions};
use crate::store::{Queries, Store, StoreError, UserEvent, UserEventKind};
use crate::tx::Executor;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub scan_interval: Duration,
    /// Events younger than this are left to the after-create hook
    pub min_age: Duration,
    pub batch_size: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            min_age: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// The task that delivers `event`
fn task_for(event: &UserEvent) -> Task {
    match event.kind {
        UserEventKind::UserCreated => Task::SendVerifyEmail(PayloadSendVerifyEmail {
            username: event.username.clone(),
        }),
    }
}

pub struct OutboxRelay<S: Store> {
    executor: Executor<S>,
    distributor: Arc<dyn TaskDistributor>,
    task_options: TaskOptions,
    config: RelayConfig,
}

impl<S: Store> OutboxRelay<S> {
    pub fn new(
        executor: Executor<S>,
        distributor: Arc<dyn TaskDistributor>,
        task_options: TaskOptions,
        config: RelayConfig,
    ) -> Self {
        Self {
            executor,
            distributor,
            task_options,
            config,
        }
    }

    /// Relay one batch. Returns the number of events delivered.
    pub async fn scan_once(&self) -> Result<usize, StoreError> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.config.min_age).unwrap_or_default();
        let limit = self.config.batch_size;
        let events = self
            .executor
            .exec(move |tx| {
                Box::pin(async move { tx.list_pending_user_events(cutoff, limit).await })
            })
            .await?;

        if events.is_empty() {
            debug!("No pending user events");
            return Ok(0);
        }

        let mut relayed = 0;
        for event in events {
            let task = task_for(&event);
            let distributor = self.distributor.clone();
            let opts = self.task_options.clone();
            let event_id = event.id;

            let result = self
                .executor
                .exec(move |tx| {
                    Box::pin(async move {
                        if !tx.mark_user_event_published(event_id).await? {
                            return Ok(None);
                        }
                        distributor
                            .distribute_task(task, opts)
                            .await
                            .map(Some)
                            .map_err(|e| StoreError::Transient(format!("enqueue failed: {}", e)))
                    })
                })
                .await;

            match result {
                Ok(Some(info)) => {
                    relayed += 1;
                    info!(
                        event_id,
                        username = %event.username,
                        task_id = %info.id,
                        "Relayed user event"
                    );
                }
                Ok(None) => debug!(event_id, "User event already published"),
                Err(e) => warn!(
                    event_id,
                    username = %event.username,
                    error = %e,
                    "Failed to relay user event, will retry next scan"
                ),
            }
        }
        Ok(relayed)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            min_age_secs = self.config.min_age.as_secs(),
            "Starting outbox relay"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.scan_once().await {
                error!(error = %e, "Outbox scan failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Outbox relay stopped");
    }
}
