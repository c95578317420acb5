//! Mailer Integration Tests
//!
//! Retry behavior against a scripted transport, template overrides from a
//! directory, and delivery scheduled through the background runner.

use async_trait::async_trait;
use greenlight::{
    error::{MailerError, RenderError, TransportError},
    mailer::{transport::build_message, Backoff, Envelope, Mailer, RetryPolicy, TemplateSet, Transport},
    services::BackgroundRunner,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Transport that plays back scripted results, succeeding once the script runs out
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    calls: Mutex<Vec<Envelope>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<(), TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn fail_times(n: usize) -> Arc<Self> {
        Self::new(
            (0..n)
                .map(|i| Err(TransportError::Failed(format!("421 try again ({})", i + 1))))
                .collect(),
        )
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.calls.lock().push(envelope.clone());
        self.script.lock().pop_front().unwrap_or(Ok(()))
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[derive(Serialize)]
struct WelcomeData {
    #[serde(rename = "ID")]
    id: i64,
    #[serde(rename = "activationToken")]
    activation_token: String,
}

fn welcome() -> WelcomeData {
    WelcomeData {
        id: 123,
        activation_token: "P4B3URJZJ2NW5UPZC2OHN4H2NM".to_string(),
    }
}

fn mailer_with(transport: Arc<ScriptedTransport>, templates: TemplateSet, max_attempts: u32) -> Mailer {
    Mailer::new(
        transport,
        Arc::new(templates),
        "Greenlight <no-reply@greenlight.example>",
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(500),
            backoff: Backoff::Fixed,
            attempt_timeout: Duration::from_secs(5),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_fails_twice_then_succeeds_with_three_attempts() {
    let transport = ScriptedTransport::fail_times(2);
    let mailer = mailer_with(transport.clone(), TemplateSet::builtin(), 3);

    let result = mailer
        .send("bob@example.com", "user_welcome.tmpl", &welcome())
        .await;

    assert!(result.is_ok());
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fails_twice_with_two_attempts_is_delivery_error() {
    let transport = ScriptedTransport::fail_times(2);
    let mailer = mailer_with(transport.clone(), TemplateSet::builtin(), 2);

    let err = mailer
        .send("bob@example.com", "user_welcome.tmpl", &welcome())
        .await
        .unwrap_err();

    match err {
        MailerError::Delivery { attempts, source } => {
            assert_eq!(attempts, 2);
            // Last underlying error is the one reported
            assert_eq!(source, TransportError::Failed("421 try again (2)".into()));
        },
        other => panic!("expected Delivery, got {:?}", other),
    }
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_missing_template_makes_no_transport_calls() {
    let transport = ScriptedTransport::fail_times(0);
    let mailer = mailer_with(transport.clone(), TemplateSet::builtin(), 3);

    let err = mailer
        .send("bob@example.com", "no_such_template.tmpl", &welcome())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MailerError::Render(RenderError::NotFound(ref name)) if name == "no_such_template.tmpl"
    ));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fixed_delay_between_attempts() {
    let transport = ScriptedTransport::fail_times(2);
    let mailer = mailer_with(transport.clone(), TemplateSet::builtin(), 3);

    let start = tokio::time::Instant::now();
    mailer
        .send("bob@example.com", "token_activation.tmpl", &welcome())
        .await
        .unwrap();

    // Two retries at 500ms each
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1000));
    assert!(elapsed < Duration::from_millis(1100));
}

#[tokio::test]
async fn test_template_directory_override() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("digest.tmpl"),
        r#"
subject = "Your weekly digest"
plain_body = "Hello {{ Name }}, you have {{ Count }} new movies."
html_body = "<p>Hello {{ Name }}, you have {{ Count }} new movies.</p>"
"#,
    )
    .unwrap();

    let transport = ScriptedTransport::fail_times(0);
    let templates = TemplateSet::with_dir(dir.path()).unwrap();
    let mailer = mailer_with(transport.clone(), templates, 1);

    mailer
        .send(
            "carol@example.com",
            "digest.tmpl",
            &serde_json::json!({"Name": "Carol", "Count": 3}),
        )
        .await
        .unwrap();

    let calls = transport.calls.lock();
    assert_eq!(calls[0].message.subject, "Your weekly digest");
    assert_eq!(
        calls[0].message.plain_body,
        "Hello Carol, you have 3 new movies."
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_scheduled_on_background_runner() {
    let transport = ScriptedTransport::fail_times(1);
    let mailer = Arc::new(mailer_with(transport.clone(), TemplateSet::builtin(), 3));
    let runner = BackgroundRunner::new();

    for recipient in ["a@example.com", "b@example.com"] {
        let mailer = Arc::clone(&mailer);
        runner.run_fallible("send_welcome", async move {
            mailer.send(recipient, "user_welcome.tmpl", &welcome()).await
        });
    }
    assert_eq!(runner.outstanding(), 2);

    assert!(runner.wait(Duration::from_secs(10)).await.is_complete());
    assert_eq!(transport.call_count(), 3);
    assert_eq!(runner.stats().failed, 0);
}

/// Builds the real MIME message and counts calls, without a relay
#[derive(Default)]
struct BuildingTransport {
    calls: Mutex<usize>,
}

#[async_trait]
impl Transport for BuildingTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        *self.calls.lock() += 1;
        build_message(envelope).map(|_| ())
    }

    fn name(&self) -> &'static str {
        "building"
    }
}

#[tokio::test(start_paused = true)]
async fn test_unbuildable_recipient_fails_once_without_backoff() {
    let transport = Arc::new(BuildingTransport::default());
    let mailer = Mailer::new(
        transport.clone(),
        Arc::new(TemplateSet::builtin()),
        "Greenlight <no-reply@greenlight.example>",
        RetryPolicy::default(),
    );

    let start = tokio::time::Instant::now();
    let err = mailer
        .send("bob@", "user_welcome.tmpl", &welcome())
        .await
        .unwrap_err();

    assert!(err.is_permanent());
    assert!(!err.is_render());
    match err {
        MailerError::Rejected { source } => {
            assert!(matches!(source, TransportError::InvalidMessage(ref m) if m.starts_with("recipient")));
        },
        other => panic!("expected Rejected, got {:?}", other),
    }
    assert_eq!(*transport.calls.lock(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);

    // A valid address goes through on the first attempt
    mailer
        .send("bob@example.com", "user_welcome.tmpl", &welcome())
        .await
        .unwrap();
    assert_eq!(*transport.calls.lock(), 2);
}
