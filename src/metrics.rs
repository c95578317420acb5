//! Prometheus metrics for the API runtime
//!
//! Collectors are registered in the default registry on first use.
//! [`gather_metrics`] renders them in the Prometheus text format for the
//! `/metrics` endpoint.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // === Admission ===

    /// Requests rejected by the rate limiter
    pub static ref REQUESTS_REJECTED: IntCounter = register_int_counter!(
        "greenlight_requests_rejected_total",
        "Requests rejected by the per-client rate limiter"
    ).unwrap();

    /// Client buckets tracked after the last sweep
    pub static ref RATE_LIMIT_BUCKETS: IntGauge = register_int_gauge!(
        "greenlight_rate_limit_buckets",
        "Client token buckets currently tracked"
    ).unwrap();

    // === Background tasks ===

    /// Background tasks currently running
    pub static ref BACKGROUND_TASKS: IntGauge = register_int_gauge!(
        "greenlight_background_tasks",
        "Detached background tasks currently running"
    ).unwrap();

    /// Background tasks that panicked
    pub static ref BACKGROUND_TASK_PANICS: IntCounter = register_int_counter!(
        "greenlight_background_task_panics_total",
        "Background tasks that terminated by panicking"
    ).unwrap();

    // === Mail ===

    /// Individual transport attempts by outcome
    pub static ref MAIL_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "greenlight_mail_attempts_total",
        "Mail transport attempts",
        &["outcome"]
    ).unwrap();

    /// Completed send calls by outcome
    pub static ref MAIL_SENT: IntCounterVec = register_int_counter_vec!(
        "greenlight_mail_sent_total",
        "Mail send calls by final outcome",
        &["outcome"]
    ).unwrap();
}

/// Render all registered metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}
