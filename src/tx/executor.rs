//! Transactional Executor
//!
//! Runs a unit of work inside one store transaction: commit on success,
//! rollback on failure. Holds no business logic.

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::store::{Store, StoreError, TxHandle};

pub struct Executor<S: Store> {
    store: Arc<S>,
    deadline: Option<Duration>,
}

impl<S: Store> Clone for Executor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            deadline: self.deadline,
        }
    }
}

impl<S: Store> Executor<S> {
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<S>) -> Self {
        Self {
            store,
            deadline: None,
        }
    }

    /// Bound the work inside every unit (lock waits included) by `deadline`.
    /// On expiry the work is cut off and the transaction rolled back, so a
    /// `DeadlineExceeded` never follows a commit. Commit itself is not bounded.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Execute `f` atomically
    ///
    /// # Example
    ///
    /// ```ignore
    /// let account = executor
    ///     .exec(move |tx| Box::pin(async move { tx.get_account(id).await }))
    ///     .await?;
    /// ```
    pub async fn exec<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, StoreError>> + Send,
    {
        let mut tx = self.store.begin().await?;

        let outcome = match self.deadline {
            Some(limit) => tokio::time::timeout(limit, f(&mut tx))
                .await
                .unwrap_or(Err(StoreError::DeadlineExceeded(limit))),
            None => f(&mut tx).await,
        };

        match outcome {
            // commit runs unbounded: its result is the outcome
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                debug!(error = %err, code = err.code(), "Unit of work failed, rolling back");
                if let Err(rb_err) = tx.rollback().await {
                    error!(
                        error = %err,
                        rollback_error = %rb_err,
                        "Rollback failed, transaction outcome unknown"
                    );
                    return Err(StoreError::RollbackFailed {
                        source: Box::new(err),
                        rollback: Box::new(rb_err),
                    });
                }
                Err(err)
            }
        }
    }
}
