//! Store Error Types
//!
//! One taxonomy shared by every store backend and every transaction built
//! on top of the executor.

use std::time::Duration;
use thiserror::Error;

/// Entity store error
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Uniqueness violation (duplicate username, email, owner+currency)
    #[error("already exists: {0}")]
    Conflict(String),

    /// Referenced row is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller-supplied data violates a precondition
    #[error("validation failed: {0}")]
    Validation(String),

    /// Connection loss, lock-wait timeout, deadlock victim
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The unit of work did not finish before the executor deadline
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("database error: {0}")]
    Database(String),

    /// The unit of work failed and the rollback failed as well.
    /// The write may or may not have applied.
    #[error("tx err: {source}, rb err: {rollback}")]
    RollbackFailed {
        source: Box<StoreError>,
        rollback: Box<StoreError>,
    },
}

impl StoreError {
    /// Stable error code for callers mapping errors onto responses
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Conflict(_) => "CONFLICT",
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Validation(_) => "VALIDATION",
            StoreError::Transient(_) => "TRANSIENT",
            StoreError::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::RollbackFailed { .. } => "UNKNOWN_STATE",
        }
    }

    /// Whether re-invoking the whole transaction may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Transient(_) | StoreError::DeadlineExceeded(_)
        )
    }

    /// The caller must re-verify state before retrying
    pub fn is_unknown_state(&self) -> bool {
        matches!(self, StoreError::RollbackFailed { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) => {
                if db.is_unique_violation() {
                    return StoreError::Conflict(db.message().to_string());
                }
                if db.is_foreign_key_violation() {
                    return StoreError::NotFound(db.message().to_string());
                }
                match db.code().as_deref() {
                    // deadlock_detected, lock_not_available, serialization_failure, query_canceled
                    Some("40P01") | Some("55P03") | Some("40001") | Some("57014") => {
                        StoreError::Transient(db.message().to_string())
                    }
                    _ => StoreError::Database(e.to_string()),
                }
            }
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => StoreError::Transient(e.to_string()),
            _ => StoreError::Database(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(StoreError::Conflict("user".into()).code(), "CONFLICT");
        assert_eq!(StoreError::NotFound("account".into()).code(), "NOT_FOUND");
        assert_eq!(
            StoreError::DeadlineExceeded(Duration::from_secs(1)).code(),
            "DEADLINE_EXCEEDED"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(StoreError::Transient("lock timeout".into()).is_retryable());
        assert!(StoreError::DeadlineExceeded(Duration::from_millis(5)).is_retryable());
        assert!(!StoreError::Conflict("user".into()).is_retryable());
        assert!(!StoreError::Validation("amount".into()).is_retryable());
    }

    #[test]
    fn test_rollback_failed_keeps_both_errors() {
        let err = StoreError::RollbackFailed {
            source: Box::new(StoreError::NotFound("account 7".into())),
            rollback: Box::new(StoreError::Transient("connection reset".into())),
        };
        assert!(err.is_unknown_state());
        assert!(!err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("account 7"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_from_sqlx_row_not_found() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_from_sqlx_pool_timeout_is_transient() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
    }
}
