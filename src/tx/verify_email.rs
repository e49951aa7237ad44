//! Email verification
//!
//! Consumes a one-time code and flips the owner's verified flag in one unit
//! of work. The conditional update on the code row is the serialization
//! point: concurrent attempts with the same id see exactly one winner.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::executor::Executor;
use crate::store::{
    Queries, Store, StoreError, UpdateUserParams, UpdateVerifyEmailParams, User, VerifyEmail,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailTxParams {
    pub email_id: i64,
    pub secret_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailTxResult {
    pub user: User,
    pub verify_email: VerifyEmail,
}

impl<S: Store> Executor<S> {
    pub async fn verify_email_tx(
        &self,
        arg: VerifyEmailTxParams,
    ) -> Result<VerifyEmailTxResult, StoreError> {
        if arg.secret_code.is_empty() {
            return Err(StoreError::Validation("secret code is empty".to_string()));
        }
        let email_id = arg.email_id;

        let result = self
            .exec(move |tx| {
                Box::pin(async move {
                    let verify_email = tx
                        .update_verify_email(UpdateVerifyEmailParams {
                            id: arg.email_id,
                            secret_code: arg.secret_code,
                        })
                        .await?
                        .ok_or_else(|| {
                            StoreError::NotFound(format!(
                                "verification {} is invalid, used or expired",
                                arg.email_id
                            ))
                        })?;

                    let user = tx
                        .update_user(UpdateUserParams {
                            username: verify_email.username.clone(),
                            is_email_verified: Some(true),
                            ..Default::default()
                        })
                        .await?;

                    Ok(VerifyEmailTxResult { user, verify_email })
                })
            })
            .await?;

        info!(email_id, username = %result.user.username, "Email verified");
        Ok(result)
    }
}
