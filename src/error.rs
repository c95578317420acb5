//! Error types for the API runtime

use std::time::Duration;
use thiserror::Error;

/// Main error type for the API runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Client exceeded its request budget
    #[error("Rate limit exceeded for {client}")]
    AdmissionRejected {
        /// Key of the client that was throttled
        client: String,
    },

    /// Mail rendering or delivery error
    #[error("Mailer error: {0}")]
    Mailer(#[from] MailerError),

    /// A background task panicked
    #[error("Background task '{task}' panicked: {message}")]
    TaskPanic {
        /// Name the task was scheduled under
        task: String,
        /// Panic payload, if it was a string
        message: String,
    },

    /// Background tasks still running when the drain deadline passed
    #[error("Drain timed out after {timeout:?} with {remaining} task(s) still running")]
    DrainTimeout {
        /// Deadline that was exceeded
        timeout: Duration,
        /// Tasks still outstanding at the deadline
        remaining: usize,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// HTTP server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by [`crate::mailer::Mailer::send`]
#[derive(Error, Debug)]
pub enum MailerError {
    /// Template is missing or could not be rendered
    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    /// Every delivery attempt failed
    #[error("Delivery failed after {attempts} attempt(s): {source}")]
    Delivery {
        /// Number of attempts made
        attempts: u32,
        /// Error from the final attempt
        #[source]
        source: TransportError,
    },

    /// Transport refused the message outright; not retried
    #[error("Message rejected: {source}")]
    Rejected {
        /// Permanent transport error
        #[source]
        source: TransportError,
    },
}

impl MailerError {
    /// True for caller-fixable template problems, false for transport failures
    pub fn is_render(&self) -> bool {
        matches!(self, MailerError::Render(_))
    }

    /// True when retrying the same send cannot succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, MailerError::Render(_) | MailerError::Rejected { .. })
    }
}

/// Template rendering errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// No template registered under this name
    #[error("Template not found: {0}")]
    NotFound(String),

    /// Template source could not be parsed
    #[error("Malformed template {name}: {message}")]
    Malformed {
        /// Template name
        name: String,
        /// Parser message
        message: String,
    },

    /// Variable has no matching value in the data
    #[error("Template {name} section {section}: no value for '{field}'")]
    MissingField {
        /// Template name
        name: String,
        /// Section being rendered (subject, plain_body, html_body)
        section: &'static str,
        /// Dotted field path
        field: String,
    },

    /// Rendered section came out empty
    #[error("Template {name} produced an empty {section}")]
    EmptySection {
        /// Template name
        name: String,
        /// Section that was empty
        section: &'static str,
    },

    /// Data could not be serialized for rendering
    #[error("Template data could not be serialized: {0}")]
    Data(String),
}

/// Transport-level delivery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Message could not be built (bad address, header)
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Connection or protocol failure talking to the relay
    #[error("Transport failure: {0}")]
    Failed(String),

    /// A single attempt exceeded its deadline
    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Failures that will repeat on every attempt
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::InvalidMessage(_))
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// File path
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed
    #[error("Failed to parse config file {path}: {message}")]
    Parse {
        /// File path
        path: String,
        /// Parser message
        message: String,
    },

    /// Environment variable had an unparseable value
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name
        var: String,
        /// Raw value
        value: String,
    },

    /// Semantic validation failure
    #[error("{0}")]
    Invalid(String),
}

/// HTTP server errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// Listener could not bind
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed {
        /// Address that failed to bind
        addr: String,
        /// Reason for the bind failure
        reason: String,
    },

    /// Listener stopped with a transport error
    #[error("Listener error: {0}")]
    Listener(String),

    /// Graceful HTTP shutdown exceeded its deadline
    #[error("Graceful HTTP shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_and_delivery_are_distinguishable() {
        let render: MailerError = RenderError::NotFound("missing.tmpl".into()).into();
        assert!(render.is_render());

        let delivery = MailerError::Delivery {
            attempts: 3,
            source: TransportError::Failed("connection refused".into()),
        };
        assert!(!delivery.is_render());
        assert!(!delivery.is_permanent());
        assert!(delivery.to_string().contains("3 attempt(s)"));

        let rejected = MailerError::Rejected {
            source: TransportError::InvalidMessage("recipient: Invalid input".into()),
        };
        assert!(rejected.is_permanent());
        assert!(!rejected.is_render());
    }

    #[test]
    fn test_missing_field_message() {
        let err = RenderError::MissingField {
            name: "user_welcome.tmpl".into(),
            section: "subject",
            field: "Name".into(),
        };
        assert_eq!(
            err.to_string(),
            "Template user_welcome.tmpl section subject: no value for 'Name'"
        );
    }

    #[test]
    fn test_drain_timeout_message() {
        let err = Error::DrainTimeout {
            timeout: Duration::from_secs(5),
            remaining: 2,
        };
        assert!(err.to_string().contains("2 task(s)"));
    }
}
