//! Request and response types for the HTTP API

use crate::network::RateLimitStats;
use crate::services::BackgroundStats;
use axum::{
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Health and diagnostics
// =============================================================================

/// Healthcheck response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "available" while the process is serving
    pub status: String,
    /// Environment and version
    pub system_info: SystemInfo,
}

/// Static facts about the running service
#[derive(Debug, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Deployment environment
    pub environment: String,
    /// Crate version
    pub version: String,
}

/// `/debug/vars` response
#[derive(Debug, Serialize)]
pub struct DebugVars {
    /// Crate version
    pub version: &'static str,
    /// Build timestamp, "unknown" unless set at compile time
    pub build_time: &'static str,
    /// Deployment environment
    pub environment: String,
    /// Unix seconds
    pub timestamp: i64,
    /// Seconds since startup
    pub uptime_secs: i64,
    /// running, draining or stopped
    pub shutdown_state: &'static str,
    /// Background runner counters
    pub background_tasks: BackgroundStats,
    /// Rate limiter counters
    pub rate_limiter: RateLimitStats,
}

// =============================================================================
// Notifications
// =============================================================================

/// `POST /v1/notifications` body
#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    /// Address to deliver to
    #[serde(default)]
    pub recipient: String,
    /// Template name, e.g. `user_welcome.tmpl`
    #[serde(default)]
    pub template: String,
    /// Values for the template variables
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NotificationRequest {
    /// Field errors, keyed by field name; empty when valid
    pub fn validate(&self) -> BTreeMap<String, String> {
        let mut errors = BTreeMap::new();
        let recipient = self.recipient.trim();
        if recipient.is_empty() {
            errors.insert("recipient".to_string(), "must be provided".to_string());
        } else if recipient.parse::<lettre::Address>().is_err() {
            errors.insert(
                "recipient".to_string(),
                "must be a valid email address".to_string(),
            );
        }
        if self.template.trim().is_empty() {
            errors.insert("template".to_string(), "must be provided".to_string());
        }
        errors
    }
}

/// `POST /v1/notifications` response
#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationAccepted {
    /// Human-readable confirmation
    pub message: String,
}

// =============================================================================
// Errors
// =============================================================================

/// Error responses; all render as `{"error": ...}`
#[derive(Debug)]
pub enum ApiError {
    /// 400
    BadRequest(String),
    /// 404
    NotFound,
    /// 405
    MethodNotAllowed(Method),
    /// 422 with per-field messages
    Validation(BTreeMap<String, String>),
    /// 429
    RateLimited,
    /// 500
    Internal,
}

impl ApiError {
    /// Status code for this error
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::BadRequest(message) => serde_json::json!({ "error": message }),
            ApiError::NotFound => {
                serde_json::json!({ "error": "the requested resource could not be found" })
            },
            ApiError::MethodNotAllowed(method) => serde_json::json!({
                "error": format!("the {} method is not supported for this resource", method)
            }),
            ApiError::Validation(fields) => serde_json::json!({ "error": fields }),
            ApiError::RateLimited => serde_json::json!({ "error": "rate limit exceeded" }),
            ApiError::Internal => serde_json::json!({
                "error": "the server encountered a problem and could not process your request"
            }),
        };

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}
