//! Send-verify-email task
//!
//! Producer side: [`enqueue_verify_email`], used as the after-create hook
//! and by the outbox relay. Consumer side: [`SendVerifyEmailHandler`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::distributor::TaskDistributor;
use super::error::{QueueError, TaskError};
use super::processor::TaskHandler;
use super::task::{PayloadSendVerifyEmail, Task, TaskInfo, TaskOptions};
use crate::mail::EmailSender;
use crate::store::{CreateVerifyEmailParams, Queries, Store, StoreError};
use crate::tx::Executor;
use crate::util::random_string;

pub const SECRET_CODE_LEN: usize = 32;
pub const VERIFY_EMAIL_SUBJECT: &str = "Welcome to Simple Bank";

pub async fn enqueue_verify_email(
    distributor: &dyn TaskDistributor,
    username: &str,
    opts: TaskOptions,
) -> Result<TaskInfo, QueueError> {
    distributor
        .distribute_task_send_verify_email(
            PayloadSendVerifyEmail {
                username: username.to_string(),
            },
            opts,
        )
        .await
}

pub fn verify_email_link(url_base: &str, email_id: i64, secret_code: &str) -> String {
    format!(
        "{}?email_id={}&secret_code={}",
        url_base, email_id, secret_code
    )
}

pub struct SendVerifyEmailHandler<S: Store> {
    executor: Executor<S>,
    mailer: Arc<dyn EmailSender>,
    url_base: String,
}

impl<S: Store> SendVerifyEmailHandler<S> {
    pub fn new(executor: Executor<S>, mailer: Arc<dyn EmailSender>, url_base: impl Into<String>) -> Self {
        Self {
            executor,
            mailer,
            url_base: url_base.into(),
        }
    }
}

#[async_trait]
impl<S: Store> TaskHandler for SendVerifyEmailHandler<S> {
    async fn handle(&self, task: Task) -> Result<(), TaskError> {
        let Task::SendVerifyEmail(payload) = task;
        let username = payload.username;

        let (user, verify_email) = self
            .executor
            .exec(move |tx| {
                Box::pin(async move {
                    let user = tx.get_user(&username).await?;
                    let verify_email = tx
                        .create_verify_email(CreateVerifyEmailParams {
                            username: user.username.clone(),
                            email: user.email.clone(),
                            secret_code: random_string(SECRET_CODE_LEN),
                        })
                        .await?;
                    Ok((user, verify_email))
                })
            })
            .await
            .map_err(|e| match e {
                // stale task, the user is gone
                StoreError::NotFound(msg) => TaskError::SkipRetry(format!("user not found: {}", msg)),
                other => TaskError::Retry(format!("failed to create verify email: {}", other)),
            })?;

        let link = verify_email_link(&self.url_base, verify_email.id, &verify_email.secret_code);
        let content = format!(
            "Hello {},<br/>\nThank you for registering with us!<br/>\nPlease <a href=\"{}\">click here</a> to verify your email address.<br/>\n",
            user.full_name, link
        );

        self.mailer
            .send_email(VERIFY_EMAIL_SUBJECT, &content, &[user.email.clone()], &[], &[], &[])
            .await
            .map_err(|e| TaskError::Retry(format!("failed to send verify email: {}", e)))?;

        info!(
            username = %user.username,
            email = %user.email,
            email_id = verify_email.id,
            "Verification email sent"
        );
        Ok(())
    }
}
