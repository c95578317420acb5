//! Greenlight API Server
//!
//! # Endpoints
//!
//! - `GET /v1/healthcheck` - Health check
//! - `POST /v1/notifications` - Schedule a templated email
//! - `GET /debug/vars` - Runtime diagnostics
//! - `GET /metrics` - Prometheus metrics
//!
//! # CLI Commands
//!
//! - `start` - Start the HTTP server (default if no command specified)
//! - `check-config` - Validate configuration and print a summary
//!
//! # Configuration
//!
//! The server reads configuration from:
//! 1. `--config` flag or `GREENLIGHT_CONFIG` environment variable (path to TOML file)
//! 2. `./application.toml` in current directory
//! 3. Default configuration
//!
//! Environment variables and then command-line flags override file values.
//!
//! # Exit codes
//!
//! 0 after a clean shutdown; 1 on startup failure or when background tasks
//! were still running at the drain deadline.

use clap::{Parser, Subcommand};
use greenlight::{
    config::{ApplicationConfig, MonitoringConfig, TransportKind},
    server::{self, AppState},
    Error,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Definition
// =============================================================================

/// Greenlight API server
#[derive(Parser)]
#[command(name = "greenlight-api")]
#[command(version)]
#[command(about = "Greenlight JSON API server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (overrides GREENLIGHT_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override listen address (e.g., 0.0.0.0:4000)
    #[arg(short, long, global = true)]
    listen: Option<String>,

    /// Override environment (development|staging|production)
    #[arg(long, global = true)]
    env: Option<String>,

    /// Enable or disable the rate limiter
    #[arg(long, global = true)]
    limiter_enabled: Option<bool>,

    /// Rate limiter maximum requests per second
    #[arg(long, global = true)]
    limiter_rps: Option<f64>,

    /// Rate limiter maximum burst
    #[arg(long, global = true)]
    limiter_burst: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Start,

    /// Validate configuration without starting the server
    CheckConfig {
        /// Also print the effective configuration as TOML
        #[arg(long)]
        show: bool,
    },
}

impl Cli {
    /// Apply command-line overrides on top of file and environment settings
    fn apply_overrides(&self, config: &mut ApplicationConfig) {
        if let Some(listen) = &self.listen {
            config.server.listen_addr = listen.clone();
        }
        if let Some(env) = &self.env {
            config.server.env = env.clone();
        }
        if let Some(enabled) = self.limiter_enabled {
            config.limiter.enabled = enabled;
        }
        if let Some(rps) = self.limiter_rps {
            config.limiter.rps = rps;
        }
        if let Some(burst) = self.limiter_burst {
            config.limiter.burst = burst;
        }
    }
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

/// Validate configuration and print summary
fn cmd_check_config(config: &ApplicationConfig, show: bool) -> Result<(), Error> {
    println!("Configuration is valid!");
    println!();
    println!("Server Settings:");
    println!("  Listen address: {}", config.server.listen_addr);
    println!("  Environment: {}", config.server.env);
    println!(
        "  HTTP shutdown timeout: {}s",
        config.server.http_shutdown_timeout_secs
    );
    println!(
        "  Background drain timeout: {}s",
        config.background.drain_timeout_secs
    );
    println!();
    println!("Rate Limiter:");
    println!("  Enabled: {}", config.limiter.enabled);
    if config.limiter.enabled {
        println!("  Requests/sec: {}", config.limiter.rps);
        println!("  Burst: {}", config.limiter.burst);
    }
    println!();
    println!("Mail:");
    match config.transport_kind() {
        TransportKind::Smtp => {
            println!("  Transport: smtp://{}:{}", config.smtp.host, config.smtp.port)
        },
        TransportKind::Log => println!("  Transport: log (development)"),
    }
    println!("  Sender: {}", config.smtp.sender);
    println!(
        "  Retries: {} attempts, {}ms {:?} backoff",
        config.mailer.max_attempts, config.mailer.retry_delay_ms, config.mailer.backoff
    );

    if show {
        println!();
        println!("{}", config.to_redacted_toml()?);
    }

    Ok(())
}

// =============================================================================
// Server Startup
// =============================================================================

/// Install the global tracing subscriber
fn init_tracing(monitoring: &MonitoringConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&monitoring.log_level));

    if monitoring.structured_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

/// Run the server until shutdown and return the exit code
async fn cmd_start(config: ApplicationConfig) -> Result<ExitCode, Error> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        env = %config.server.env,
        "Starting Greenlight API server"
    );

    let addr = config.listen_addr()?;
    let state = AppState::from_config(config)?;
    let listener = server::bind(addr).await?;

    let signals = state.shutdown.listen_for_signals();
    let report = server::serve(state, listener).await;
    signals.abort();

    let code = report.exit_code();
    if let Err(e) = report.into_result() {
        warn!(error = %e, "Shutdown incomplete");
    }
    Ok(code)
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let (mut config, sources) = match ApplicationConfig::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        },
    };
    cli.apply_overrides(&mut config);

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    match &cli.command {
        Some(Commands::CheckConfig { show }) => {
            return match cmd_check_config(&config, *show) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{}", e);
                    ExitCode::FAILURE
                },
            };
        },
        Some(Commands::Start) | None => {},
    }

    init_tracing(&config.monitoring);
    sources.log();

    match cmd_start(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Server failed to start");
            ExitCode::FAILURE
        },
    }
}
