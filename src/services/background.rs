//! Background task tracking
//!
//! Request handlers hand detached work (sending a welcome email, say) to the
//! [`BackgroundRunner`] instead of calling `tokio::spawn` directly. The runner
//! counts every task it starts and the shutdown path waits on that count, so
//! the process never exits with work silently dropped.
//!
//! # Accounting
//!
//! The counter is incremented synchronously inside [`BackgroundRunner::run`],
//! before the task is spawned, and decremented by a [`TaskGuard`] owned by the
//! spawned task. The guard's `Drop` runs on every exit path (normal return,
//! returned error, caught panic), so each increment is matched by exactly one
//! decrement.

use crate::metrics;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// Result of waiting for background tasks to drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every task finished before the deadline
    Complete,
    /// The deadline passed with tasks still running
    TimedOut {
        /// Tasks still outstanding at the deadline
        remaining: usize,
    },
}

impl DrainOutcome {
    /// True if the drain finished before the deadline
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainOutcome::Complete)
    }
}

/// Counters shared by the runner and all of its guards
#[derive(Debug, Default)]
struct RunnerState {
    outstanding: AtomicUsize,
    idle: Notify,
    started: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

/// Registration of one outstanding task
///
/// Dropping the guard unregisters the task and wakes drain waiters when the
/// count reaches zero.
#[derive(Debug)]
pub struct TaskGuard {
    state: Arc<RunnerState>,
    name: &'static str,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        metrics::BACKGROUND_TASKS.dec();
        let previous = self.state.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug!(task = self.name, remaining = previous - 1, "Background task finished");
        if previous == 1 {
            self.state.idle.notify_waiters();
        }
    }
}

/// Tracker for detached background tasks
///
/// Cheap to clone; all clones share the same counter.
///
/// # Example
///
/// ```rust
/// use greenlight::services::BackgroundRunner;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let runner = BackgroundRunner::new();
/// runner.run("greet", async {
///     // send an email, call a webhook, ...
/// });
///
/// let outcome = runner.wait(Duration::from_secs(5)).await;
/// assert!(outcome.is_complete());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct BackgroundRunner {
    state: Arc<RunnerState>,
}

impl BackgroundRunner {
    /// Create a runner with no outstanding tasks
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new task and return the guard that will uncount it
    fn register(&self, name: &'static str) -> TaskGuard {
        self.state.outstanding.fetch_add(1, Ordering::AcqRel);
        self.state.started.fetch_add(1, Ordering::Relaxed);
        metrics::BACKGROUND_TASKS.inc();
        TaskGuard {
            state: Arc::clone(&self.state),
            name,
        }
    }

    /// Run `task` detached from the caller
    ///
    /// Returns immediately. A panic inside the task is caught and logged; it
    /// never reaches the caller or takes down the process. Must be called from
    /// within a tokio runtime.
    pub fn run<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.register(name);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(payload) = AssertUnwindSafe(task).catch_unwind().await {
                record_panic(&state, name, payload.as_ref());
            }
        });
    }

    /// Run a task that can fail, logging the error if it does
    ///
    /// Errors are terminal to the task only.
    pub fn run_fallible<F, E>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        self.run(name, async move {
            if let Err(e) = task.await {
                state.failed.fetch_add(1, Ordering::Relaxed);
                error!(task = name, error = %e, "Background task failed");
            }
        });
    }

    /// Run a synchronous closure on the blocking thread pool
    ///
    /// Same accounting and panic handling as [`run`](Self::run).
    pub fn run_blocking<F>(&self, name: &'static str, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.register(name);
        let state = Arc::clone(&self.state);

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(task)) {
                record_panic(&state, name, payload.as_ref());
            }
        });
    }

    /// Number of tasks started but not yet finished
    pub fn outstanding(&self) -> usize {
        self.state.outstanding.load(Ordering::Acquire)
    }

    /// Wait until no tasks are outstanding or `timeout` elapses
    pub async fn wait(&self, timeout: Duration) -> DrainOutcome {
        match tokio::time::timeout(timeout, self.wait_idle()).await {
            Ok(()) => DrainOutcome::Complete,
            Err(_) => {
                let remaining = self.outstanding();
                warn!(
                    remaining = remaining,
                    timeout_ms = timeout.as_millis() as u64,
                    "Background drain timed out"
                );
                DrainOutcome::TimedOut { remaining }
            },
        }
    }

    /// Resolve once the outstanding count is zero
    async fn wait_idle(&self) {
        loop {
            // Register interest before checking the count so a guard dropped
            // in between still wakes us.
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Get statistics
    pub fn stats(&self) -> BackgroundStats {
        BackgroundStats {
            outstanding: self.outstanding(),
            started: self.state.started.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
            panicked: self.state.panicked.load(Ordering::Relaxed),
        }
    }
}

/// Background runner statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackgroundStats {
    /// Tasks currently running
    pub outstanding: usize,
    /// Tasks started since creation
    pub started: u64,
    /// Tasks that returned an error
    pub failed: u64,
    /// Tasks that panicked
    pub panicked: u64,
}

fn record_panic(state: &RunnerState, name: &'static str, payload: &(dyn Any + Send)) {
    state.panicked.fetch_add(1, Ordering::Relaxed);
    metrics::BACKGROUND_TASK_PANICS.inc();

    let err = crate::error::Error::TaskPanic {
        task: name.to_string(),
        message: panic_message(payload),
    };
    error!(task = name, error = %err, "Background task panicked");
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
