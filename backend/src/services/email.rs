use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{error, info};

use crate::config::SmtpConfig;

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("invalid address '{0}'")]
    Address(String),
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("smtp delivery failed: {0}")]
    Transport(String),
}

/// An outgoing message as composed by the send_email action.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError>;
}

#[derive(Clone)]
pub struct SmtpEmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl SmtpEmailSender {
    pub fn new(smtp_config: &SmtpConfig) -> Self {
        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Self {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
        }
    }

    fn compose(&self, email: &OutgoingEmail) -> Result<Message, EmailError> {
        let from_raw = format!("{} <{}>", self.from_name, self.from_email);
        let from = from_raw
            .parse::<Mailbox>()
            .map_err(|_| EmailError::Address(from_raw.clone()))?;

        let mut builder = Message::builder().from(from).subject(email.subject.as_str());
        for to in &email.to {
            let mailbox = to.parse::<Mailbox>().map_err(|_| EmailError::Address(to.clone()))?;
            builder = builder.to(mailbox);
        }

        let message = match &email.text_body {
            Some(text) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html_body.clone()),
                    ),
            ),
            None => builder
                .header(ContentType::TEXT_HTML)
                .body(email.html_body.clone()),
        };
        message.map_err(|e| EmailError::Build(e.to_string()))
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        let message = self.compose(email)?;

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent successfully to {}", email.to.join(", "));
                Ok(())
            }
            Err(e) => {
                error!("Failed to send email to {}: {}", email.to.join(", "), e);
                Err(EmailError::Transport(e.to_string()))
            }
        }
    }
}

/// Used when SMTP is not configured: messages are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), EmailError> {
        info!(
            to = %email.to.join(", "),
            subject = %email.subject,
            "SMTP not configured, email not delivered"
        );
        Ok(())
    }
}
