//! Notification delivery
//!
//! [`Mailer::send`] renders a named template and delivers it over a
//! [`Transport`], retrying transient failures:
//!
//! 1. Render subject, plain body and HTML body. A missing or broken template
//!    fails immediately with [`MailerError::Render`]; no delivery is attempted.
//! 2. Try the transport up to `max_attempts` times, sleeping between attempts
//!    according to the [`Backoff`]. Each attempt is bounded by
//!    `attempt_timeout`. The first success returns.
//! 3. If every attempt fails, return [`MailerError::Delivery`] carrying the
//!    last transport error. A message the transport cannot build (bad
//!    address or header) fails once with [`MailerError::Rejected`].
//!
//! `send` sleeps between attempts, so handlers should schedule it on the
//! [`BackgroundRunner`](crate::services::BackgroundRunner) rather than await it.

pub mod template;
pub mod transport;

pub use template::{RenderedMessage, TemplateRenderer, TemplateSet};
pub use transport::{Envelope, LogTransport, SmtpConfig, SmtpTransport, Transport};

use crate::error::{MailerError, RenderError, TransportError};
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Retry policy
// ============================================================================

/// Delay shape between delivery attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay grows by the base delay each attempt: d, 2d, 3d, ...
    Linear,
}

/// Bounded retry settings for delivery
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay between attempts
    pub delay: Duration,
    /// How the delay changes across attempts
    pub backoff: Backoff,
    /// Deadline for a single transport call
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
            backoff: Backoff::Fixed,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Validate the policy
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }
        if self.attempt_timeout.is_zero() {
            return Err("attempt_timeout must be > 0".to_string());
        }
        Ok(())
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.saturating_mul(attempt.max(1)),
        }
    }
}

/// Record of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    /// 1-based attempt number
    pub index: u32,
    /// Transport error, if the attempt failed
    pub error: Option<TransportError>,
    /// Delay before the next attempt, if there is one
    pub backoff: Option<Duration>,
}

impl DeliveryAttempt {
    /// True if the attempt delivered the message
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

// ============================================================================
// Mailer
// ============================================================================

/// Template-rendering mail sender with retries
#[derive(Clone)]
pub struct Mailer {
    transport: Arc<dyn Transport>,
    renderer: Arc<dyn TemplateRenderer>,
    sender: String,
    policy: RetryPolicy,
}

impl std::fmt::Debug for Mailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailer")
            .field("transport", &self.transport.name())
            .field("sender", &self.sender)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Mailer {
    /// Create a mailer
    pub fn new(
        transport: Arc<dyn Transport>,
        renderer: Arc<dyn TemplateRenderer>,
        sender: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            renderer,
            sender: sender.into(),
            policy,
        }
    }

    /// Retry policy in effect
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Name of the underlying transport
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Render `template` with `data` and deliver it to `recipient`
    pub async fn send<T>(&self, recipient: &str, template: &str, data: &T) -> Result<(), MailerError>
    where
        T: Serialize + ?Sized,
    {
        let envelope = match self.render(recipient, template, data) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::MAIL_SENT.with_label_values(&["render_error"]).inc();
                warn!(recipient = recipient, template = template, error = %e, "Mail not rendered");
                return Err(e.into());
            },
        };

        let (result, attempts) = self.deliver(&envelope).await;
        match &result {
            Ok(()) => {
                metrics::MAIL_SENT.with_label_values(&["delivered"]).inc();
                info!(
                    recipient = recipient,
                    template = template,
                    attempts = attempts.len(),
                    "Mail delivered"
                );
            },
            Err(e) => {
                let outcome = if e.is_permanent() { "rejected" } else { "failed" };
                metrics::MAIL_SENT.with_label_values(&[outcome]).inc();
                warn!(
                    recipient = recipient,
                    template = template,
                    attempts = attempts.len(),
                    error = %e,
                    "Mail delivery failed"
                );
            },
        }
        result
    }

    /// Render a template into an envelope without sending it
    pub fn render<T>(&self, recipient: &str, template: &str, data: &T) -> Result<Envelope, RenderError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data).map_err(|e| RenderError::Data(e.to_string()))?;
        let message = self.renderer.render(template, &data)?;
        Ok(Envelope {
            sender: self.sender.clone(),
            recipient: recipient.to_string(),
            message,
        })
    }

    /// Deliver an already rendered envelope, retrying per the policy
    ///
    /// Returns the final result together with a record of every attempt.
    pub async fn deliver(
        &self,
        envelope: &Envelope,
    ) -> (Result<(), MailerError>, Vec<DeliveryAttempt>) {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = Vec::with_capacity(max_attempts as usize);

        for index in 1..=max_attempts {
            let outcome =
                match tokio::time::timeout(self.policy.attempt_timeout, self.transport.send(envelope))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(self.policy.attempt_timeout)),
                };

            match outcome {
                Ok(()) => {
                    metrics::MAIL_ATTEMPTS.with_label_values(&["ok"]).inc();
                    attempts.push(DeliveryAttempt {
                        index,
                        error: None,
                        backoff: None,
                    });
                    return (Ok(()), attempts);
                },
                Err(e) if e.is_permanent() => {
                    metrics::MAIL_ATTEMPTS.with_label_values(&["error"]).inc();
                    debug!(
                        attempt = index,
                        recipient = %envelope.recipient,
                        transport = self.transport.name(),
                        error = %e,
                        "Message rejected, not retrying"
                    );
                    attempts.push(DeliveryAttempt {
                        index,
                        error: Some(e.clone()),
                        backoff: None,
                    });
                    return (Err(MailerError::Rejected { source: e }), attempts);
                },
                Err(e) => {
                    metrics::MAIL_ATTEMPTS.with_label_values(&["error"]).inc();
                    let backoff = (index < max_attempts).then(|| self.policy.delay_after(index));
                    debug!(
                        attempt = index,
                        max_attempts = max_attempts,
                        recipient = %envelope.recipient,
                        transport = self.transport.name(),
                        error = %e,
                        backoff_ms = backoff.map(|d| d.as_millis() as u64),
                        "Delivery attempt failed"
                    );
                    attempts.push(DeliveryAttempt {
                        index,
                        error: Some(e.clone()),
                        backoff,
                    });

                    match backoff {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => {
                            return (
                                Err(MailerError::Delivery {
                                    attempts: index,
                                    source: e,
                                }),
                                attempts,
                            )
                        },
                    }
                },
            }
        }

        // Loop always returns on the last attempt
        (
            Err(MailerError::Delivery {
                attempts: max_attempts,
                source: TransportError::Failed("no attempts made".to_string()),
            }),
            attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Transport that replays a fixed script of outcomes, then succeeds
    #[derive(Default)]
    struct Scripted {
        script: Mutex<VecDeque<Result<(), TransportError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn failing(times: usize) -> Arc<Self> {
            let script = (0..times)
                .map(|_| Err(TransportError::Failed("connection reset".into())))
                .collect();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, _envelope: &Envelope) -> Result<(), TransportError> {
            *self.calls.lock() += 1;
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn mailer(transport: Arc<Scripted>, max_attempts: u32, backoff: Backoff) -> Mailer {
        Mailer::new(
            transport,
            Arc::new(TemplateSet::builtin()),
            "Greenlight <no-reply@greenlight.example>",
            RetryPolicy {
                max_attempts,
                delay: Duration::from_millis(100),
                backoff,
                attempt_timeout: Duration::from_secs(1),
            },
        )
    }

    fn welcome_data() -> serde_json::Value {
        serde_json::json!({"ID": 42, "activationToken": "TOKEN"})
    }

    #[test]
    fn test_backoff_shapes() {
        let mut policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(500));

        policy.backoff = Backoff::Linear;
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(1500));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let transport = Scripted::failing(2);
        let mailer = mailer(Arc::clone(&transport), 3, Backoff::Fixed);

        mailer
            .send("alice@example.com", "user_welcome.tmpl", &welcome_data())
            .await
            .unwrap();
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let transport = Scripted::failing(2);
        let mailer = mailer(Arc::clone(&transport), 2, Backoff::Fixed);

        let err = mailer
            .send("alice@example.com", "user_welcome.tmpl", &welcome_data())
            .await
            .unwrap_err();
        assert!(!err.is_render());
        match err {
            MailerError::Delivery { attempts, source } => {
                assert_eq!(attempts, 2);
                assert_eq!(source, TransportError::Failed("connection reset".into()));
            },
            other => panic!("expected Delivery, got {:?}", other),
        }
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_template_skips_transport() {
        let transport = Scripted::failing(0);
        let mailer = mailer(Arc::clone(&transport), 3, Backoff::Fixed);

        let err = mailer
            .send("alice@example.com", "missing.tmpl", &welcome_data())
            .await
            .unwrap_err();
        assert!(err.is_render());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_records_and_linear_delays() {
        let transport = Scripted::failing(2);
        let mailer = mailer(Arc::clone(&transport), 3, Backoff::Linear);
        let envelope = mailer
            .render("alice@example.com", "user_welcome.tmpl", &welcome_data())
            .unwrap();

        let start = tokio::time::Instant::now();
        let (result, attempts) = mailer.deliver(&envelope).await;
        assert!(result.is_ok());
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[0].backoff, Some(Duration::from_millis(100)));
        assert_eq!(attempts[1].backoff, Some(Duration::from_millis(200)));
        assert!(attempts[2].succeeded());
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_message_is_not_retried() {
        let transport = Arc::new(Scripted {
            script: Mutex::new(
                vec![Err(TransportError::InvalidMessage("recipient: Invalid input".into()))].into(),
            ),
            calls: Mutex::new(0),
        });
        let mailer = mailer(Arc::clone(&transport), 3, Backoff::Fixed);

        let start = tokio::time::Instant::now();
        let err = mailer
            .send("bob@", "user_welcome.tmpl", &welcome_data())
            .await
            .unwrap_err();

        assert!(err.is_permanent());
        assert!(!err.is_render());
        assert!(matches!(
            err,
            MailerError::Rejected {
                source: TransportError::InvalidMessage(_)
            }
        ));
        assert_eq!(transport.calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_times_out() {
        struct Hung;

        #[async_trait]
        impl Transport for Hung {
            async fn send(&self, _envelope: &Envelope) -> Result<(), TransportError> {
                std::future::pending().await
            }

            fn name(&self) -> &'static str {
                "hung"
            }
        }

        let mailer = Mailer::new(
            Arc::new(Hung),
            Arc::new(TemplateSet::builtin()),
            "no-reply@greenlight.example",
            RetryPolicy {
                max_attempts: 2,
                delay: Duration::from_millis(10),
                backoff: Backoff::Fixed,
                attempt_timeout: Duration::from_secs(2),
            },
        );

        let err = mailer
            .send("alice@example.com", "user_welcome.tmpl", &welcome_data())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MailerError::Delivery {
                attempts: 2,
                source: TransportError::Timeout(_)
            }
        ));
    }
}
