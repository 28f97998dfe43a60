use async_trait::async_trait;
use chrono::{DateTime, Local};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid mail address '{0}'")]
    Address(String),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp relay error: {0}")]
    Relay(String),
    #[error("smtp send error: {0}")]
    Send(String),
}

/// Best-effort mail collaborator. Callers log failures and move on; a
/// mail error never affects scheduling.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_mail(&self, to: &[String], subject: &str, body: &str) -> Result<(), MailError>;
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// SMTP mailer over lettre's async transport (STARTTLS relay).
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_mail(&self, to: &[String], subject: &str, body: &str) -> Result<(), MailError> {
        let from: Mailbox = self
            .config
            .from
            .parse()
            .map_err(|_| MailError::Address(self.config.from.clone()))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN);
        for recipient in to {
            let mailbox: Mailbox = recipient
                .parse()
                .map_err(|_| MailError::Address(recipient.clone()))?;
            builder = builder.to(mailbox);
        }

        let message = builder.body(body.to_string())?;

        let credentials = Credentials::new(
            self.config.username.clone(),
            self.config.password.clone(),
        );
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
            .map_err(|err| MailError::Relay(err.to_string()))?
            .port(self.config.port)
            .credentials(credentials)
            .build();

        transport
            .send(message)
            .await
            .map_err(|err| MailError::Send(err.to_string()))?;
        info!("Sent mail '{}' to {}", subject, to.join(", "));
        Ok(())
    }
}

/// Used when no SMTP relay is configured: notifications land in the
/// worker log instead of a mailbox.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_mail(&self, to: &[String], subject: &str, body: &str) -> Result<(), MailError> {
        info!(
            "Mail (no SMTP configured) to {}: {} / {}",
            to.join(", "),
            subject,
            body.replace('\n', "; ")
        );
        Ok(())
    }
}

/// Subject line for a timeout notice. `addr` is the worker identity from
/// its configuration.
pub fn timeout_subject(addr: &str) -> String {
    format!("{addr} task execution timeout")
}

/// Body for a timeout notice.
pub fn timeout_body(
    name: &str,
    command: &str,
    args: &str,
    started_at: DateTime<Local>,
    timeout_secs: i64,
) -> String {
    format!(
        "task: {name}\ncommand: {command} {args}\nstarted: {}\ntimeout: {timeout_secs}s",
        started_at.format("%Y-%m-%d %H:%M:%S")
    )
}
