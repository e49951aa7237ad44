//! PostgreSQL queue backend
//!
//! Tasks live in the `tasks` table. Workers claim with
//! `FOR UPDATE SKIP LOCKED` and stamp a lease; a task whose lease ran out
//! (worker crashed mid-task) becomes claimable again. Each claim bumps
//! `claim_seq`, and every later write is conditional on it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;

use super::QueueBackend;
use crate::worker::error::QueueError;
use crate::worker::task::{TaskId, TaskMessage, TaskState};

const DEFAULT_LEASE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Archived tasks, newest first
    pub async fn list_archived(&self, limit: i64) -> Result<Vec<TaskMessage>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_type, payload, queue, retried, max_attempts, process_at, last_error,
                   claim_seq
            FROM tasks
            WHERE state = $1
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(TaskState::FailedPermanent.id())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }
}

fn row_to_message(row: &PgRow) -> Result<TaskMessage, QueueError> {
    let id: String = row.try_get("id")?;
    let id = id
        .parse::<TaskId>()
        .map_err(|e| QueueError::Backend(format!("bad task id {}: {}", id, e)))?;
    let retried: i32 = row.try_get("retried")?;
    let max_attempts: i32 = row.try_get("max_attempts")?;
    let claim_seq: i64 = row.try_get("claim_seq")?;
    Ok(TaskMessage {
        id,
        task_type: row.try_get("task_type")?,
        payload: row.try_get("payload")?,
        queue: row.try_get("queue")?,
        retried: column_value(id, "retried", retried)?,
        max_attempts: column_value(id, "max_attempts", max_attempts)?,
        process_at: row.try_get("process_at")?,
        last_error: row.try_get("last_error")?,
        claim: column_value(id, "claim_seq", claim_seq)?,
    })
}

/// Narrow a signed column into its unsigned field; a negative value is a corrupt row
fn column_value<T, U>(id: TaskId, column: &str, value: T) -> Result<U, QueueError>
where
    T: Copy + std::fmt::Display,
    U: TryFrom<T>,
{
    U::try_from(value)
        .map_err(|_| QueueError::Backend(format!("task {}: bad {} {}", id, column, value)))
}

/// Zero rows touched means the claim is no longer ours
fn ensure_held(msg: &TaskMessage, rows_affected: u64) -> Result<(), QueueError> {
    if rows_affected == 0 {
        return Err(QueueError::LeaseLost(msg.id));
    }
    Ok(())
}

fn claim_seq(msg: &TaskMessage) -> Result<i64, QueueError> {
    i64::try_from(msg.claim).map_err(|_| QueueError::LeaseLost(msg.id))
}

fn to_i32(value: u32) -> Result<i32, QueueError> {
    i32::try_from(value).map_err(|_| QueueError::InvalidOptions(format!("{} out of range", value)))
}

#[async_trait]
impl QueueBackend for PgQueue {
    fn lease(&self) -> Duration {
        self.lease
    }

    async fn enqueue(&self, msg: TaskMessage) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, payload, queue, state, retried, max_attempts, process_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(msg.id.to_string())
        .bind(&msg.task_type)
        .bind(&msg.payload)
        .bind(&msg.queue)
        .bind(TaskState::Enqueued.id())
        .bind(to_i32(msg.retried)?)
        .bind(to_i32(msg.max_attempts)?)
        .bind(msg.process_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<TaskMessage>, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET state = $2, lease_until = NOW() + make_interval(secs => $3),
                claim_seq = claim_seq + 1, updated_at = NOW()
            WHERE id = (
                SELECT id FROM tasks
                WHERE queue = $1
                  AND process_at <= NOW()
                  AND (state = $4 OR (state = $2 AND lease_until < NOW()))
                ORDER BY process_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, task_type, payload, queue, retried, max_attempts, process_at, last_error,
                      claim_seq
            "#,
        )
        .bind(queue)
        .bind(TaskState::InProgress.id())
        .bind(self.lease.as_secs_f64())
        .bind(TaskState::Enqueued.id())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_message).transpose()
    }

    async fn extend_lease(&self, msg: &TaskMessage) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET lease_until = NOW() + make_interval(secs => $4), updated_at = NOW()
            WHERE id = $1 AND claim_seq = $2 AND state = $3
            "#,
        )
        .bind(msg.id.to_string())
        .bind(claim_seq(msg)?)
        .bind(TaskState::InProgress.id())
        .bind(self.lease.as_secs_f64())
        .execute(&self.pool)
        .await?;
        ensure_held(msg, result.rows_affected())
    }

    async fn complete(&self, msg: &TaskMessage) -> Result<(), QueueError> {
        let result =
            sqlx::query("DELETE FROM tasks WHERE id = $1 AND claim_seq = $2 AND state = $3")
                .bind(msg.id.to_string())
                .bind(claim_seq(msg)?)
                .bind(TaskState::InProgress.id())
                .execute(&self.pool)
                .await?;
        ensure_held(msg, result.rows_affected())
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = $4, retried = retried + 1, process_at = $5, last_error = $6,
                lease_until = NULL, updated_at = NOW()
            WHERE id = $1 AND claim_seq = $2 AND state = $3
            "#,
        )
        .bind(msg.id.to_string())
        .bind(claim_seq(msg)?)
        .bind(TaskState::InProgress.id())
        .bind(TaskState::Enqueued.id())
        .bind(process_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        ensure_held(msg, result.rows_affected())
    }

    async fn archive(&self, msg: &TaskMessage, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = $4, retried = retried + 1, last_error = $5,
                lease_until = NULL, updated_at = NOW()
            WHERE id = $1 AND claim_seq = $2 AND state = $3
            "#,
        )
        .bind(msg.id.to_string())
        .bind(claim_seq(msg)?)
        .bind(TaskState::InProgress.id())
        .bind(TaskState::FailedPermanent.id())
        .bind(error)
        .execute(&self.pool)
        .await?;
        ensure_held(msg, result.rows_affected())
    }
}
