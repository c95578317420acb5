//! Coordinated graceful shutdown
//!
//! The [`ShutdownCoordinator`] owns the process shutdown state machine:
//!
//! ```text
//! Running ──signal──▶ Draining ──http stopped + background drained──▶ Stopped
//! ```
//!
//! Transitions only move forward. A second signal while draining is logged
//! and otherwise ignored.
//!
//! While draining, the HTTP listener stops accepting connections and active
//! requests get `http_timeout` to finish. The coordinator then waits up to
//! `drain_timeout` for background tasks. Both deadlines are hard: when one
//! passes, shutdown moves on regardless.

use crate::error::{Error, ServerError};
use crate::services::background::{BackgroundRunner, DrainOutcome};
use std::future::Future;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Process shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    /// Accepting connections
    Running,
    /// Listener closed, finishing requests and background tasks
    Draining,
    /// Shutdown finished, process may exit
    Stopped,
}

impl ShutdownState {
    /// Lowercase name for logs and diagnostics
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownState::Running => "running",
            ShutdownState::Draining => "draining",
            ShutdownState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shutdown deadlines
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time active HTTP requests get to finish once draining starts
    pub http_timeout: Duration,

    /// Time background tasks get to finish after the listener stops
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl ShutdownConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.http_timeout.is_zero() {
            return Err("http shutdown timeout must be > 0".to_string());
        }
        if self.drain_timeout.is_zero() {
            return Err("background drain timeout must be > 0".to_string());
        }
        Ok(())
    }
}

/// Outcome of a completed shutdown
#[derive(Debug)]
pub struct ShutdownReport {
    /// Result of stopping the HTTP listener
    pub http: Result<(), ServerError>,
    /// Result of draining background tasks
    pub drain: DrainOutcome,
    /// Time from the start of draining to `Stopped`
    pub elapsed: Duration,
    /// Drain deadline that applied
    pub drain_timeout: Duration,
}

impl ShutdownReport {
    /// True when background work drained within its deadline
    ///
    /// An HTTP shutdown failure is reported in logs but does not make the
    /// stop unclean; only lost background work does.
    pub fn is_clean(&self) -> bool {
        self.drain.is_complete()
    }

    /// Exit code for the process: 0 when clean, 1 otherwise
    pub fn exit_code(&self) -> ExitCode {
        if self.is_clean() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        }
    }

    /// Convert an incomplete drain into [`Error::DrainTimeout`]
    pub fn into_result(self) -> Result<(), Error> {
        match self.drain {
            DrainOutcome::Complete => Ok(()),
            DrainOutcome::TimedOut { remaining } => Err(Error::DrainTimeout {
                timeout: self.drain_timeout,
                remaining,
            }),
        }
    }
}

/// Orchestrates signal handling, listener shutdown and background drain
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    runner: BackgroundRunner,
    state: watch::Sender<ShutdownState>,
    draining_since: parking_lot::Mutex<Option<Instant>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator in the `Running` state
    pub fn new(config: ShutdownConfig, runner: BackgroundRunner) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            config,
            runner,
            state,
            draining_since: parking_lot::Mutex::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Get configuration
    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    /// Move forward to `to`; returns false if already there or beyond
    fn advance(&self, to: ShutdownState) -> bool {
        self.state.send_if_modified(|current| {
            if to > *current {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Start draining
    ///
    /// Idempotent: returns `true` only for the call that performed the
    /// `Running → Draining` transition.
    pub fn begin_shutdown(&self, reason: &str) -> bool {
        if self.advance(ShutdownState::Draining) {
            *self.draining_since.lock() = Some(Instant::now());
            info!(
                reason = reason,
                background_tasks = self.runner.outstanding(),
                "Shutdown started, draining"
            );
            true
        } else {
            info!(
                reason = reason,
                state = %self.state(),
                "Shutdown already in progress, ignoring"
            );
            false
        }
    }

    /// Future that resolves once draining has started
    ///
    /// Suitable for `axum::serve(..).with_graceful_shutdown(..)`.
    pub fn draining(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.state.subscribe();
        async move {
            // Sender lives as long as the coordinator; if it is gone we are stopping anyway
            let _ = rx.wait_for(|s| *s >= ShutdownState::Draining).await;
        }
    }

    /// Future that resolves once shutdown has finished
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.state.subscribe();
        async move {
            let _ = rx.wait_for(|s| *s == ShutdownState::Stopped).await;
        }
    }

    /// Listen for SIGINT / SIGTERM and begin shutdown on the first one
    ///
    /// Later signals are logged and ignored. The task ends once the
    /// coordinator reaches `Stopped`.
    pub fn listen_for_signals(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let stopped = coordinator.stopped();
            tokio::pin!(stopped);

            loop {
                tokio::select! {
                    signal_name = shutdown_signal() => {
                        coordinator.begin_shutdown(signal_name);
                    },
                    _ = &mut stopped => break,
                }
            }
        })
    }

    /// Drive an HTTP server future through shutdown
    ///
    /// `server` should itself stop accepting connections when
    /// [`draining`](Self::draining) resolves. Once draining starts it gets
    /// `http_timeout` to finish; after that it is dropped, abandoning any
    /// connections still open. Then background tasks are drained and the
    /// coordinator reaches `Stopped`.
    ///
    /// If the server exits on its own first (a listener failure), shutdown
    /// begins immediately.
    pub async fn run_server<S>(&self, server: S) -> ShutdownReport
    where
        S: Future<Output = std::io::Result<()>> + Send,
    {
        tokio::pin!(server);

        let http = tokio::select! {
            result = &mut server => {
                self.begin_shutdown("listener exited");
                result.map_err(|e| ServerError::Listener(e.to_string()))
            },
            _ = self.draining() => {
                match tokio::time::timeout(self.config.http_timeout, &mut server).await {
                    Ok(result) => result.map_err(|e| ServerError::Listener(e.to_string())),
                    Err(_) => Err(ServerError::ShutdownTimeout(self.config.http_timeout)),
                }
            },
        };

        self.finish(http).await
    }

    /// Drain background tasks and move to `Stopped`
    ///
    /// Called after the listener has stopped. Begins shutdown first if nothing
    /// has yet. Never fails: problems are logged and carried in the report.
    pub async fn finish(&self, http: Result<(), ServerError>) -> ShutdownReport {
        self.begin_shutdown("finish requested");

        match &http {
            Ok(()) => info!("HTTP listener stopped"),
            Err(e) => error!(error = %e, "HTTP listener did not stop cleanly"),
        }

        info!(
            tasks = self.runner.outstanding(),
            timeout_ms = self.config.drain_timeout.as_millis() as u64,
            "Waiting for background tasks"
        );
        let drain = self.runner.wait(self.config.drain_timeout).await;

        if let DrainOutcome::TimedOut { remaining } = drain {
            let err = Error::DrainTimeout {
                timeout: self.config.drain_timeout,
                remaining,
            };
            warn!(error = %err, "Abandoning background tasks");
        }

        let started = (*self.draining_since.lock()).unwrap_or_else(Instant::now);
        self.advance(ShutdownState::Stopped);
        let elapsed = started.elapsed();

        info!(
            clean = drain.is_complete(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Shutdown complete"
        );

        ShutdownReport {
            http,
            drain,
            elapsed,
            drain_timeout: self.config.drain_timeout,
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM and return which one arrived
///
/// If a handler cannot be installed a warning is logged and that signal is
/// never reported; the other one still works.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {},
            Err(e) => {
                warn!(
                    error = %e,
                    "Ctrl+C handler installation failed - SIGINT shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(
                    error = %e,
                    "SIGTERM handler installation failed - SIGTERM shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}
