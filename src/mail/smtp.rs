//! SMTP notifier (STARTTLS relay with credentials)

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::Path;
use tracing::info;

use super::{EmailSender, MailError};
use crate::config::MailConfig;

pub struct SmtpSender {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSender {
    pub fn new(config: &MailConfig) -> Result<Self, MailError> {
        let from = parse_mailbox(&format!(
            "{} <{}>",
            config.sender_name, config.from_address
        ))?;

        info!(
            host = %config.smtp_host,
            port = config.smtp_port,
            from = %config.from_address,
            "Initializing SMTP sender"
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| MailError::Transport(format!("smtp relay {}: {}", config.smtp_host, e)))?
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.from_address.clone(),
                config.password.clone(),
            ))
            .build();

        Ok(Self { from, transport })
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailError> {
    address.parse::<Mailbox>().map_err(|e| MailError::Address {
        address: address.to_string(),
        reason: e.to_string(),
    })
}

async fn attachment(path: &str) -> Result<SinglePart, MailError> {
    let attach_err = |reason: String| MailError::Attachment {
        path: path.to_string(),
        reason,
    };
    let body = tokio::fs::read(path)
        .await
        .map_err(|e| attach_err(e.to_string()))?;
    let filename = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| attach_err("path has no file name".to_string()))?;
    let content_type =
        ContentType::parse("application/octet-stream").map_err(|e| attach_err(e.to_string()))?;
    Ok(Attachment::new(filename).body(body, content_type))
}

#[async_trait]
impl EmailSender for SmtpSender {
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

        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for addr in to {
            builder = builder.to(parse_mailbox(addr)?);
        }
        for addr in cc {
            builder = builder.cc(parse_mailbox(addr)?);
        }
        for addr in bcc {
            builder = builder.bcc(parse_mailbox(addr)?);
        }

        let mut body = MultiPart::mixed().singlepart(SinglePart::html(content.to_string()));
        for path in attach_files {
            body = body.singlepart(attachment(path).await?);
        }

        let email = builder
            .multipart(body)
            .map_err(|e| MailError::Build(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| MailError::Transport(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mailbox() {
        let mailbox = parse_mailbox("Simple Bank <bank@example.com>").unwrap();
        assert_eq!(mailbox.email.to_string(), "bank@example.com");
        assert!(matches!(
            parse_mailbox("not an address"),
            Err(MailError::Address { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_attachment() {
        let err = attachment("/nonexistent/statement.pdf").await.unwrap_err();
        assert!(matches!(err, MailError::Attachment { .. }));
    }
}
