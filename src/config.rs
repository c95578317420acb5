//! Configuration management for the Greenlight API
//!
//! Settings come from, in increasing priority:
//!
//! 1. Built-in defaults
//! 2. A TOML file: `--config` / `GREENLIGHT_CONFIG`, else `./application.toml` if present
//! 3. Environment variables (`PORT`, `ENV`, `LIMITER_*`, `SMTP_*`, `CORS_TRUSTED_ORIGINS`, `RUST_LOG`)
//! 4. Command-line flags (applied by the binary)
//!
//! A `.env` file in the working directory is read first; it never overrides
//! variables that are already set.

use crate::error::ConfigError;
use crate::mailer::{Backoff, RetryPolicy, SmtpConfig};
use crate::network::RateLimitConfig;
use crate::services::ShutdownConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "GREENLIGHT_CONFIG";

/// Config file looked for in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "application.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApplicationConfig {
    /// HTTP listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-client rate limiting
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// SMTP relay
    #[serde(default)]
    pub smtp: SmtpSettings,

    /// Delivery retry policy
    #[serde(default)]
    pub mailer: MailerConfig,

    /// Background task draining
    #[serde(default)]
    pub background: BackgroundConfig,

    /// Logging and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address, `host:port`
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Deployment environment (development, staging, production)
    #[serde(default = "default_env")]
    pub env: String,

    /// Time active requests get to finish on shutdown
    #[serde(default = "default_shutdown_secs")]
    pub http_shutdown_timeout_secs: u64,

    /// Origins allowed by CORS; empty allows any
    #[serde(default)]
    pub cors_trusted_origins: Vec<String>,
}

/// Rate limiter configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimiterConfig {
    /// Enable admission control
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sustained requests per second per client
    #[serde(default = "default_rps")]
    pub rps: f64,

    /// Maximum burst per client
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Idle time after which a client's bucket is evicted
    #[serde(default = "default_bucket_ttl_secs")]
    pub bucket_ttl_secs: u64,

    /// Interval between eviction sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Key clients on X-Forwarded-For / X-Real-IP
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

/// SMTP relay configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpSettings {
    /// Relay host; empty selects the log transport in development
    #[serde(default)]
    pub host: String,

    /// Relay port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Login user
    #[serde(default)]
    pub username: String,

    /// Login password
    #[serde(default)]
    pub password: String,

    /// From address
    #[serde(default = "default_sender")]
    pub sender: String,

    /// Connection timeout
    #[serde(default = "default_smtp_timeout_secs")]
    pub timeout_secs: u64,
}

/// Mail delivery configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailerConfig {
    /// Attempts per message, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Delay shape: "fixed" or "linear"
    #[serde(default)]
    pub backoff: Backoff,

    /// Deadline for one transport call
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Directory of `*.tmpl` files that add to or override the built-in templates
    #[serde(default)]
    pub template_dir: Option<PathBuf>,
}

/// Background task configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackgroundConfig {
    /// Time background tasks get to finish on shutdown
    #[serde(default = "default_shutdown_secs")]
    pub drain_timeout_secs: u64,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Log level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default = "default_true")]
    pub structured_logging: bool,

    /// Serve `/metrics`
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// Which mail transport the configuration selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Real SMTP relay
    Smtp,
    /// Log instead of sending
    Log,
}

fn default_listen_addr() -> String { "0.0.0.0:4000".to_string() }
fn default_env() -> String { "development".to_string() }
fn default_shutdown_secs() -> u64 { 30 }
fn default_rps() -> f64 { 2.0 }
fn default_burst() -> u32 { 4 }
fn default_bucket_ttl_secs() -> u64 { 180 }
fn default_sweep_interval_secs() -> u64 { 60 }
fn default_smtp_port() -> u16 { 25 }
fn default_sender() -> String { "Greenlight <no-reply@greenlight.example>".to_string() }
fn default_smtp_timeout_secs() -> u64 { 10 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 500 }
fn default_attempt_timeout_secs() -> u64 { 15 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            env: default_env(),
            http_shutdown_timeout_secs: default_shutdown_secs(),
            cors_trusted_origins: Vec::new(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rps: default_rps(),
            burst: default_burst(),
            bucket_ttl_secs: default_bucket_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            trust_proxy_headers: false,
        }
    }
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            sender: default_sender(),
            timeout_secs: default_smtp_timeout_secs(),
        }
    }
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff: Backoff::Fixed,
            attempt_timeout_secs: default_attempt_timeout_secs(),
            template_dir: None,
        }
    }
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_shutdown_secs(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: true,
            metrics_enabled: true,
        }
    }
}

/// Files a configuration was loaded from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSources {
    /// `.env` file that was read, if any
    pub dotenv: Option<PathBuf>,
    /// TOML file that was read; `None` means built-in defaults
    pub file: Option<PathBuf>,
}

impl ConfigSources {
    /// Log where the configuration came from
    pub fn log(&self) {
        if let Some(path) = &self.dotenv {
            debug!(path = %path.display(), "Loaded .env file");
        }
        match &self.file {
            Some(path) => info!(path = %path.display(), "Loaded configuration"),
            None => info!("No configuration file, using defaults"),
        }
    }
}

impl ApplicationConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Load configuration from the usual sources
    ///
    /// `explicit` (the `--config` flag) wins over `GREENLIGHT_CONFIG`, which
    /// wins over `./application.toml`. Environment overrides are applied.
    /// Call [`validate`](Self::validate) after applying command-line flags.
    ///
    /// Nothing is logged here since tracing is usually not installed yet;
    /// log the returned [`ConfigSources`] once it is.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();

        match dotenvy::dotenv() {
            Ok(path) => sources.dotenv = Some(path),
            Err(e) if e.not_found() => {},
            Err(e) => {
                return Err(ConfigError::Parse {
                    path: ".env".to_string(),
                    message: e.to_string(),
                })
            },
        }

        let from_env = std::env::var(CONFIG_PATH_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        sources.file = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Some(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Some(PathBuf::from(DEFAULT_CONFIG_FILE)),
            None => None,
        };

        let mut config = match &sources.file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        Ok((config, sources))
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`; empty values count as unset
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        // Server
        if let Some(port) = get("PORT") {
            let port: u16 = parse_var("PORT", &port)?;
            self.server.set_port(port);
        }
        if let Some(env) = get("ENV") {
            self.server.env = env;
        }
        if let Some(origins) = get("CORS_TRUSTED_ORIGINS") {
            self.server.cors_trusted_origins =
                origins.split_whitespace().map(str::to_string).collect();
        }

        // Limiter
        if let Some(v) = get("LIMITER_ENABLED") {
            self.limiter.enabled = parse_bool("LIMITER_ENABLED", &v)?;
        }
        if let Some(v) = get("LIMITER_RPS") {
            self.limiter.rps = parse_var("LIMITER_RPS", &v)?;
        }
        if let Some(v) = get("LIMITER_BURST") {
            self.limiter.burst = parse_var("LIMITER_BURST", &v)?;
        }

        // SMTP
        if let Some(v) = get("SMTP_HOST") {
            self.smtp.host = v;
        }
        if let Some(v) = get("SMTP_PORT") {
            self.smtp.port = parse_var("SMTP_PORT", &v)?;
        }
        if let Some(v) = get("SMTP_USERNAME") {
            self.smtp.username = v;
        }
        if let Some(v) = get("SMTP_PASSWORD") {
            self.smtp.password = v;
        }
        if let Some(v) = get("SMTP_SENDER") {
            self.smtp.sender = v;
        }

        // Monitoring
        if let Some(level) = get("RUST_LOG") {
            self.monitoring.log_level = level;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;

        if self.server.http_shutdown_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.http_shutdown_timeout_secs must be > 0".to_string(),
            ));
        }

        self.rate_limit_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("limiter: {}", e)))?;
        self.retry_policy()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("mailer: {}", e)))?;
        self.shutdown_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("shutdown: {}", e)))?;

        if self.smtp.sender.trim().is_empty() {
            return Err(ConfigError::Invalid("smtp.sender cannot be empty".to_string()));
        }
        if self.transport_kind() == TransportKind::Smtp {
            if self.smtp.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "smtp.host is required outside development (env = {:?}); set SMTP_HOST",
                    self.server.env
                )));
            }
            if self.smtp.port == 0 {
                return Err(ConfigError::Invalid("smtp.port cannot be 0".to_string()));
            }
        }

        Ok(())
    }

    /// True when running in the development environment
    pub fn is_development(&self) -> bool {
        self.server.env == "development"
    }

    /// Transport selected by this configuration
    pub fn transport_kind(&self) -> TransportKind {
        if self.smtp.host.trim().is_empty() && self.is_development() {
            TransportKind::Log
        } else {
            TransportKind::Smtp
        }
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!(
                "server.listen_addr {:?} is not a valid host:port",
                self.server.listen_addr
            )))
    }

    /// Rate limiter settings
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            enabled: self.limiter.enabled,
            requests_per_sec: self.limiter.rps,
            burst: self.limiter.burst,
            bucket_ttl: Duration::from_secs(self.limiter.bucket_ttl_secs),
            sweep_interval: Duration::from_secs(self.limiter.sweep_interval_secs),
            trust_proxy_headers: self.limiter.trust_proxy_headers,
        }
    }

    /// Mail retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.mailer.max_attempts,
            delay: Duration::from_millis(self.mailer.retry_delay_ms),
            backoff: self.mailer.backoff,
            attempt_timeout: Duration::from_secs(self.mailer.attempt_timeout_secs),
        }
    }

    /// Shutdown deadlines
    pub fn shutdown_config(&self) -> ShutdownConfig {
        ShutdownConfig {
            http_timeout: Duration::from_secs(self.server.http_shutdown_timeout_secs),
            drain_timeout: Duration::from_secs(self.background.drain_timeout_secs),
        }
    }

    /// SMTP transport settings
    pub fn smtp_config(&self) -> SmtpConfig {
        SmtpConfig {
            host: self.smtp.host.clone(),
            port: self.smtp.port,
            username: self.smtp.username.clone(),
            password: self.smtp.password.clone(),
            timeout: Duration::from_secs(self.smtp.timeout_secs),
        }
    }

    /// Render as TOML with the SMTP password masked
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut copy = self.clone();
        if !copy.smtp.password.is_empty() {
            copy.smtp.password = "********".to_string();
        }
        toml::to_string_pretty(&copy).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

impl ServerConfig {
    /// Replace the port in `listen_addr`, keeping the host
    pub fn set_port(&mut self, port: u16) {
        let host = match self.listen_addr.rsplit_once(':') {
            Some((host, _)) if !host.is_empty() => host.to_string(),
            _ => "0.0.0.0".to_string(),
        };
        self.listen_addr = format!("{}:{}", host, port);
    }
}

fn parse_var<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ApplicationConfig::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:4000");
        assert!(config.limiter.enabled);
        assert_eq!(config.limiter.burst, 4);
        assert_eq!(config.mailer.max_attempts, 3);
        assert_eq!(config.transport_kind(), TransportKind::Log);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_limiter() {
        let mut config = ApplicationConfig::default();
        config.limiter.rps = 0.0;
        assert!(config.validate().is_err());

        // Disabled limiter is not validated
        config.limiter.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_listen_addr() {
        let mut config = ApplicationConfig::default();
        config.server.listen_addr = "nowhere".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_production_requires_smtp_host() {
        let mut config = ApplicationConfig::default();
        config.server.env = "production".to_string();
        assert_eq!(config.transport_kind(), TransportKind::Smtp);
        assert!(config.validate().is_err());

        config.smtp.host = "smtp.example.com".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        let mut config = ApplicationConfig::default();
        config
            .apply_overrides_from(lookup(&[
                ("PORT", "9999"),
                ("ENV", "staging"),
                ("LIMITER_ENABLED", "false"),
                ("LIMITER_RPS", "10.5"),
                ("SMTP_HOST", "smtp.example.com"),
                ("SMTP_PORT", "2525"),
                ("CORS_TRUSTED_ORIGINS", "https://a.example  https://b.example"),
                ("SMTP_USERNAME", ""),
            ]))
            .unwrap();

        assert_eq!(config.server.listen_addr, "0.0.0.0:9999");
        assert_eq!(config.server.env, "staging");
        assert!(!config.limiter.enabled);
        assert_eq!(config.limiter.rps, 10.5);
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.smtp.username, "");
        assert_eq!(
            config.server.cors_trusted_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = ApplicationConfig::default();
        let err = config
            .apply_overrides_from(lookup(&[("LIMITER_BURST", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref var, .. } if var == "LIMITER_BURST"));
    }

    #[test]
    fn test_set_port_keeps_host() {
        let mut server = ServerConfig {
            listen_addr: "127.0.0.1:4000".to_string(),
            ..Default::default()
        };
        server.set_port(8081);
        assert_eq!(server.listen_addr, "127.0.0.1:8081");

        server.listen_addr = "[::1]:4000".to_string();
        server.set_port(5000);
        assert_eq!(server.listen_addr, "[::1]:5000");
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("application.toml");
        std::fs::write(
            &path,
            r#"
[limiter]
rps = 5.0
burst = 10

[mailer]
backoff = "linear"
"#,
        )
        .unwrap();

        let config = ApplicationConfig::from_file(&path).unwrap();
        assert_eq!(config.limiter.rps, 5.0);
        assert_eq!(config.limiter.burst, 10);
        assert!(config.limiter.enabled);
        assert_eq!(config.mailer.backoff, Backoff::Linear);
        assert_eq!(config.server.listen_addr, "0.0.0.0:4000");
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            ApplicationConfig::from_file("/nonexistent/application.toml"),
            Err(ConfigError::Read { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[limiter\nrps = ").unwrap();
        assert!(matches!(
            ApplicationConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_redacted_toml_round_trips() {
        let mut config = ApplicationConfig::default();
        config.smtp.password = "hunter2".to_string();

        let text = config.to_redacted_toml().unwrap();
        assert!(!text.contains("hunter2"));
        let parsed: ApplicationConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.smtp.password, "********");
    }

    #[test]
    fn test_derived_settings() {
        let config = ApplicationConfig::default();
        let limiter = config.rate_limit_config();
        assert_eq!(limiter.burst, 4);
        assert_eq!(limiter.bucket_ttl, Duration::from_secs(180));

        let shutdown = config.shutdown_config();
        assert_eq!(shutdown.drain_timeout, Duration::from_secs(30));

        assert_eq!(config.retry_policy().delay, Duration::from_millis(500));
    }

    #[test]
    fn test_load_reports_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greenlight.toml");
        std::fs::write(&path, "[background]\ndrain_timeout_secs = 7\n").unwrap();

        let (config, sources) = ApplicationConfig::load(Some(&path)).unwrap();
        assert_eq!(sources.file.as_deref(), Some(path.as_path()));
        assert_eq!(config.background.drain_timeout_secs, 7);

        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            ApplicationConfig::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }
}
