//! Greenlight API runtime
//!
//! The resilience core of the Greenlight HTTP API:
//! - Per-client token bucket rate limiting
//! - Tracked background tasks with panic isolation and bounded draining
//! - Coordinated graceful shutdown (`Running → Draining → Stopped`)
//! - Template-rendered notification email with bounded retries

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod network;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Notification rendering and delivery with retries
pub mod mailer;

/// Background task tracking and graceful shutdown
pub mod services;

/// HTTP router, handlers and middleware
pub mod server;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ApplicationConfig;
pub use error::{Error, Result};
pub use mailer::Mailer;
pub use network::RateLimiter;
pub use server::AppState;
pub use services::{BackgroundRunner, ShutdownCoordinator, ShutdownState};
