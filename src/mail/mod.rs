//! Email notifier
//!
//! [`EmailSender`] is injected into the task handlers. Any error it returns
//! is treated as a retryable transport failure.

pub mod smtp;

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::info;

pub use smtp::SmtpSender;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailError {
    #[error("invalid address {address}: {reason}")]
    Address { address: String, reason: String },

    #[error("message has no recipients")]
    NoRecipients,

    #[error("failed to attach file {path}: {reason}")]
    Attachment { path: String, reason: String },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("failed to send email: {0}")]
    Transport(String),
}

#[async_trait]
pub trait EmailSender: Send + Sync + 'static {
    async fn send_email(
        &self,
        subject: &str,
        content: &str,
        to: &[String],
        cc: &[String],
        bcc: &[String],
        attach_files: &[String],
    ) -> Result<(), MailError>;
}

/// Logs instead of sending (mail disabled)
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

#[async_trait]
impl EmailSender for LogSender {
    async fn send_email(
        &self,
        subject: &str,
        _content: &str,
        to: &[String],
        cc: &[String],
        bcc: &[String],
        attach_files: &[String],
    ) -> Result<(), MailError> {
        if to.is_empty() {
            return Err(MailError::NoRecipients);
        }
        info!(
            subject,
            to = ?to,
            cc = cc.len(),
            bcc = bcc.len(),
            attachments = attach_files.len(),
            "mail disabled, email not sent"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub subject: String,
    pub content: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub attach_files: Vec<String>,
}

/// Records messages; can be told to fail upcoming sends
#[derive(Debug, Default)]
pub struct MemorySender {
    sent: Mutex<Vec<SentEmail>>,
    fail_next: AtomicUsize,
}

impl MemorySender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EmailSender for MemorySender {
    async fn send_email(
        &self,
        subject: &str,
        content: &str,
        to: &[String],
        cc: &[String],
        bcc: &[String],
        attach_files: &[String],
    ) -> Result<(), MailError> {
        if to.is_empty() {
            return Err(MailError::NoRecipients);
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MailError::Transport("connection refused".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(SentEmail {
                subject: subject.to_string(),
                content: content.to_string(),
                to: to.to_vec(),
                cc: cc.to_vec(),
                bcc: bcc.to_vec(),
                attach_files: attach_files.to_vec(),
            });
        Ok(())
    }
}
