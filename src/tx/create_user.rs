//! User creation with an after-commit hook
//!
//! The user row and a `user_created` outbox event commit together. The hook
//! runs only after commit; if it fails the event stays pending and the
//! outbox relay delivers it later.

use std::fmt::Display;
use std::future::Future;
use tracing::{info, warn};

use super::executor::Executor;
use crate::store::{CreateUserParams, Queries, Store, StoreError, User, UserEventKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserTxResult {
    pub user: User,
    /// False when the hook failed and delivery was left to the outbox relay
    pub after_create_delivered: bool,
}

impl<S: Store> Executor<S> {
    /// Insert a user, then run `after_create` with the committed row.
    ///
    /// Duplicate username or email is reported as [`StoreError::Conflict`];
    /// the hook never runs in that case.
    pub async fn create_user_tx<F, Fut, E>(
        &self,
        arg: CreateUserParams,
        after_create: F,
    ) -> Result<CreateUserTxResult, StoreError>
    where
        F: FnOnce(User) -> Fut + Send,
        Fut: Future<Output = Result<(), E>> + Send,
        E: Display,
    {
        let (user, event) = self
            .exec(move |tx| {
                Box::pin(async move {
                    let user = tx.create_user(arg).await?;
                    let event = tx
                        .create_user_event(&user.username, UserEventKind::UserCreated)
                        .await?;
                    Ok((user, event))
                })
            })
            .await?;

        info!(username = %user.username, event_id = event.id, "User created");

        let after_create_delivered = match after_create(user.clone()).await {
            Ok(()) => {
                let event_id = event.id;
                let marked = self
                    .exec(move |tx| {
                        Box::pin(async move { tx.mark_user_event_published(event_id).await })
                    })
                    .await;
                if let Err(e) = marked {
                    // the relay may deliver this event a second time
                    warn!(event_id, error = %e, "Failed to mark user event published");
                }
                true
            }
            Err(e) => {
                warn!(
                    username = %user.username,
                    event_id = event.id,
                    error = %e,
                    "After-create hook failed, leaving event to outbox relay"
                );
                false
            }
        };

        Ok(CreateUserTxResult {
            user,
            after_create_delivered,
        })
    }
}
