//! HTTP server for the Greenlight API
//!
//! # Endpoints
//!
//! - `GET /v1/healthcheck` - Service status, environment and version
//! - `POST /v1/notifications` - Schedule a templated email (202 Accepted)
//! - `GET /debug/vars` - Runtime diagnostics
//! - `GET /metrics` - Prometheus metrics
//!
//! # Middleware
//!
//! Outermost first: panic recovery, CORS, request tracing, rate limiting.

pub mod handlers;
pub mod middleware;
pub mod types;

use crate::config::{ApplicationConfig, TransportKind};
use crate::error::{ConfigError, Error, MailerError, ServerError};
use crate::mailer::{LogTransport, Mailer, SmtpTransport, TemplateSet, Transport};
use crate::network::RateLimiter;
use crate::services::{BackgroundRunner, ShutdownCoordinator, ShutdownReport};
use axum::{
    http::{HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

// =============================================================================
// Application State
// =============================================================================

/// Shared application state
///
/// Every long-lived component is constructed once at startup and reached
/// through this struct. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration
    pub config: Arc<ApplicationConfig>,
    /// Per-client admission control
    pub limiter: Arc<RateLimiter>,
    /// Detached task tracker
    pub runner: BackgroundRunner,
    /// Notification sender
    pub mailer: Arc<Mailer>,
    /// Shutdown state machine
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Process start time
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Assemble state from already built components
    pub fn new(
        config: ApplicationConfig,
        limiter: Arc<RateLimiter>,
        runner: BackgroundRunner,
        mailer: Mailer,
    ) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new(
            config.shutdown_config(),
            runner.clone(),
        ));
        Self {
            config: Arc::new(config),
            limiter,
            runner,
            mailer: Arc::new(mailer),
            shutdown,
            started_at: Utc::now(),
        }
    }

    /// Build every component from configuration
    ///
    /// Starts the rate limiter's sweep task, so must run inside a tokio
    /// runtime. The configuration should already be validated.
    pub fn from_config(config: ApplicationConfig) -> Result<Self, Error> {
        let transport: Arc<dyn Transport> = match config.transport_kind() {
            TransportKind::Smtp => Arc::new(
                SmtpTransport::new(&config.smtp_config())
                    .map_err(|e| ConfigError::Invalid(format!("smtp: {}", e)))?,
            ),
            TransportKind::Log => {
                info!("No SMTP host configured, logging mail instead of sending");
                Arc::new(LogTransport::new())
            },
        };

        let templates = match &config.mailer.template_dir {
            Some(dir) => TemplateSet::with_dir(dir).map_err(MailerError::from)?,
            None => TemplateSet::builtin(),
        };

        let mailer = Mailer::new(
            transport,
            Arc::new(templates),
            config.smtp.sender.clone(),
            config.retry_policy(),
        );
        let limiter = RateLimiter::new_with_cleanup(config.rate_limit_config());

        Ok(Self::new(config, limiter, BackgroundRunner::new(), mailer))
    }
}

// =============================================================================
// Router and Server Setup
// =============================================================================

/// Build CORS layer from configuration
pub fn build_cors_layer(cors_origins: &[String]) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];
    if cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(Any)
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/healthcheck",
            get(handlers::healthcheck).fallback(handlers::method_not_allowed),
        )
        .route(
            "/v1/notifications",
            post(handlers::create_notification).fallback(handlers::method_not_allowed),
        )
        .route(
            "/debug/vars",
            get(handlers::debug_vars).fallback(handlers::method_not_allowed),
        )
        .route(
            "/metrics",
            get(handlers::metrics).fallback(handlers::method_not_allowed),
        )
        .fallback(handlers::not_found)
        // Each layer wraps the ones before it, so the last is outermost
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&state.config.server.cors_trusted_origins))
        .layer(CatchPanicLayer::custom(middleware::handle_panic))
        .with_state(state)
}

/// Bind the listener
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })
}

/// Serve until shutdown completes
///
/// The listener stops accepting when the coordinator starts draining. The
/// returned report says whether background work drained in time.
pub async fn serve(state: AppState, listener: TcpListener) -> ShutdownReport {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Server listening on http://{}", addr);
    }

    let shutdown = Arc::clone(&state.shutdown);
    let app = build_router(state);
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.draining());

    shutdown.run_server(server.into_future()).await
}
