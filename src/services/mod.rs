//! Background Services Module
//!
//! Tracks detached work started by request handlers and coordinates the
//! process shutdown that waits for it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  run()   ┌──────────────────┐
//! │ Request Handler │─────────▶│ BackgroundRunner │
//! └─────────────────┘          └──────────────────┘
//!                                       ▲ wait(drain_timeout)
//! ┌─────────────────┐  signal  ┌──────────────────────┐
//! │ SIGINT/SIGTERM  │─────────▶│ ShutdownCoordinator  │──▶ HTTP listener stop
//! └─────────────────┘          └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use greenlight::services::{BackgroundRunner, ShutdownConfig, ShutdownCoordinator, ShutdownState};
//!
//! let runner = BackgroundRunner::new();
//! let coordinator = ShutdownCoordinator::new(ShutdownConfig::default(), runner);
//! assert_eq!(coordinator.state(), ShutdownState::Running);
//! ```

pub mod background;
pub mod shutdown;

pub use background::{BackgroundRunner, BackgroundStats, DrainOutcome, TaskGuard};
pub use shutdown::{
    shutdown_signal, ShutdownConfig, ShutdownCoordinator, ShutdownReport, ShutdownState,
};
