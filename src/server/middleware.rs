//! HTTP middleware

use super::types::ApiError;
use super::AppState;
use crate::network::resolve_client;
use crate::services::background::panic_message;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::any::Any;
use std::net::SocketAddr;
use tracing::{debug, error};

/// Key used when the client address cannot be determined
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Rate limiting middleware
///
/// Checks the client's token bucket before the request reaches a handler.
/// Returns 429 Too Many Requests if the bucket is empty.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let config = state.limiter.config();
    if !config.enabled {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = resolve_client(request.headers(), peer, config.trust_proxy_headers)
        .unwrap_or_else(|| {
            debug!("Client address unavailable, using shared bucket");
            UNKNOWN_CLIENT.to_string()
        });

    match state.limiter.check(&client) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!(error = %e, path = %request.uri().path(), "Request rejected");
            ApiError::RateLimited.into_response()
        },
    }
}

/// Response for a handler panic caught by `CatchPanicLayer`
///
/// The connection is closed after the response.
pub fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic_message(payload.as_ref());
    error!(panic = %message, "Request handler panicked");

    let mut response = ApiError::Internal.into_response();
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}
