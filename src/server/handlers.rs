//! HTTP handlers

use super::types::*;
use super::AppState;
use crate::metrics::gather_metrics;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use tracing::debug;

/// Build timestamp injected at compile time, if any
pub const BUILD_TIME: &str = match option_env!("GREENLIGHT_BUILD_TIME") {
    Some(t) => t,
    None => "unknown",
};

// =============================================================================
// Health & Diagnostics
// =============================================================================

/// `GET /v1/healthcheck`
pub async fn healthcheck(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "available".to_string(),
        system_info: SystemInfo {
            environment: state.config.server.env.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    })
}

/// `GET /debug/vars`
pub async fn debug_vars(State(state): State<AppState>) -> Json<DebugVars> {
    let now = Utc::now();
    Json(DebugVars {
        version: env!("CARGO_PKG_VERSION"),
        build_time: BUILD_TIME,
        environment: state.config.server.env.clone(),
        timestamp: now.timestamp(),
        uptime_secs: (now - state.started_at).num_seconds(),
        shutdown_state: state.shutdown.state().as_str(),
        background_tasks: state.runner.stats(),
        rate_limiter: state.limiter.stats(),
    })
}

/// `GET /metrics` in Prometheus text format
pub async fn metrics(State(state): State<AppState>) -> Response {
    if !state.config.monitoring.metrics_enabled {
        return ApiError::NotFound.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_metrics(),
    )
        .into_response()
}

// =============================================================================
// Notifications
// =============================================================================

/// `POST /v1/notifications`
///
/// Validates the request, schedules delivery on the background runner and
/// returns 202 without waiting for it.
pub async fn create_notification(
    State(state): State<AppState>,
    payload: Result<Json<NotificationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<NotificationAccepted>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let errors = request.validate();
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let NotificationRequest {
        recipient,
        template,
        data,
    } = request;
    let recipient = recipient.trim().to_string();
    let template = template.trim().to_string();
    debug!(recipient = %recipient, template = %template, "Scheduling notification");

    let mailer = state.mailer.clone();
    state.runner.run_fallible("send_notification", async move {
        mailer.send(&recipient, &template, &data).await
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(NotificationAccepted {
            message: "notification scheduled for delivery".to_string(),
        }),
    ))
}

// =============================================================================
// Fallbacks
// =============================================================================

/// Unmatched path
pub async fn not_found() -> ApiError {
    ApiError::NotFound
}

/// Matched path, unsupported method
pub async fn method_not_allowed(method: Method) -> ApiError {
    ApiError::MethodNotAllowed(method)
}
