//! Outbound mail transports

use crate::error::TransportError;
use crate::mailer::template::RenderedMessage;
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

/// A fully rendered message ready to hand to a transport
#[derive(Debug, Clone)]
pub struct Envelope {
    /// From address, e.g. `Greenlight <no-reply@greenlight.example>`
    pub sender: String,
    /// To address
    pub recipient: String,
    /// Subject and bodies
    pub message: RenderedMessage,
}

/// Delivers one envelope
///
/// Each call either fully succeeds or fully fails.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver the envelope once, without retrying
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// SMTP relay settings
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Relay host
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Login user
    pub username: String,
    /// Login password
    pub password: String,
    /// Connection and command timeout
    pub timeout: Duration,
}

/// SMTP transport using STARTTLS
pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    /// Build a pooled transport for the relay in `config`
    ///
    /// No connection is made until the first send.
    pub fn new(config: &SmtpConfig) -> Result<Self, TransportError> {
        let inner = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| TransportError::Failed(e.to_string()))?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .timeout(Some(config.timeout))
            .build();

        Ok(Self { inner })
    }
}

/// Build the MIME message for an envelope
pub fn build_message(envelope: &Envelope) -> Result<Message, TransportError> {
    let from: Mailbox = envelope
        .sender
        .parse()
        .map_err(|e| TransportError::InvalidMessage(format!("sender: {}", e)))?;
    let to: Mailbox = envelope
        .recipient
        .parse()
        .map_err(|e| TransportError::InvalidMessage(format!("recipient: {}", e)))?;

    Message::builder()
        .from(from)
        .to(to)
        .subject(envelope.message.subject.clone())
        .multipart(MultiPart::alternative_plain_html(
            envelope.message.plain_body.clone(),
            envelope.message.html_body.clone(),
        ))
        .map_err(|e| TransportError::InvalidMessage(e.to_string()))
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let message = build_message(envelope)?;
        self.inner
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Failed(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

/// Development transport that logs messages instead of sending them
#[derive(Debug, Default)]
pub struct LogTransport {
    sent: AtomicU64,
}

impl LogTransport {
    /// Create a log transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages "sent" so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        build_message(envelope)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            sender = %envelope.sender,
            recipient = %envelope.recipient,
            subject = %envelope.message.subject,
            body_bytes = envelope.message.plain_body.len(),
            "Mail delivery skipped (log transport)"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
