//! Token bucket rate limiter
//!
//! Admits or rejects inbound requests per client using the token bucket
//! algorithm. Each client key owns a bucket that starts full at the burst
//! capacity and refills continuously at the configured requests-per-second
//! rate. Idle buckets are swept periodically so memory stays bounded when many
//! distinct clients show up.

use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::metrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Enable rate limiting (default: true)
    pub enabled: bool,

    /// Sustained requests per second per client (default: 2)
    pub requests_per_sec: f64,

    /// Bucket capacity, the largest burst a client may send at once (default: 4)
    pub burst: u32,

    /// Buckets idle for longer than this are removed (default: 3 minutes)
    pub bucket_ttl: Duration,

    /// How often the sweep runs (default: 1 minute)
    pub sweep_interval: Duration,

    /// Derive the client key from `X-Forwarded-For` / `X-Real-IP` (default: false)
    pub trust_proxy_headers: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_sec: 2.0,
            burst: 4,
            bucket_ttl: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(60),
            trust_proxy_headers: false,
        }
    }
}

impl RateLimitConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled {
            if !(self.requests_per_sec.is_finite() && self.requests_per_sec > 0.0) {
                return Err("requests_per_sec must be > 0 when enabled".to_string());
            }
            if self.burst == 0 {
                return Err("burst must be > 0 when enabled".to_string());
            }
            if self.sweep_interval.is_zero() {
                return Err("sweep_interval must be > 0 when enabled".to_string());
            }
        }
        Ok(())
    }

    /// Bucket capacity as a token count
    pub fn capacity(&self) -> f64 {
        f64::from(self.burst)
    }
}

/// Per-client token bucket
///
/// Invariant: `0.0 <= tokens <= capacity`.
#[derive(Debug, Clone)]
pub struct ClientBucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl ClientBucket {
    /// Create a bucket that starts full
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_access: now,
        }
    }

    /// Add tokens for the time elapsed since the last refill, capped at capacity
    fn refill(&mut self, now: Instant, rate: f64, capacity: f64) {
        // A clock that goes backwards yields zero elapsed time
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(capacity);
        self.last_refill = now;
    }

    /// Refill, then take one token if available
    fn try_take(&mut self, now: Instant, rate: f64, capacity: f64) -> bool {
        self.refill(now, rate, capacity);
        self.last_access = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Check if bucket has gone unused for longer than `ttl`
    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_access) > ttl
    }

    /// Tokens currently in the bucket (as of the last refill)
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Token bucket rate limiter keyed by client identity
///
/// Lookup-and-mutate for a key happens under the owning shard's lock of the
/// concurrent map, so two concurrent admissions for the same client never
/// read the same token count. Different clients usually land on different
/// shards and do not contend.
///
/// # Example
///
/// ```rust
/// use greenlight::network::{RateLimitConfig, RateLimiter};
///
/// let limiter = RateLimiter::new(RateLimitConfig::default());
///
/// if limiter.allow("10.0.0.1") {
///     // Request allowed
/// } else {
///     // Rate limited
/// }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, ClientBucket>,
    clock: Arc<dyn Clock>,
    total_rejections: AtomicU64,
}

impl RateLimiter {
    /// Create a new rate limiter using the system clock
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a rate limiter reading time from `clock`
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            clock,
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Create a rate limiter wrapped in Arc and start its sweep task
    ///
    /// Must be called inside a tokio runtime. The sweep stops on its own once
    /// the last `Arc` to the limiter is dropped.
    pub fn new_with_cleanup(config: RateLimitConfig) -> Arc<Self> {
        let limiter = Arc::new(Self::new(config));
        if limiter.config.enabled {
            limiter.spawn_sweeper();
        }
        limiter
    }

    /// Spawn the periodic idle-bucket sweep
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately

            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(limiter) => {
                        limiter.sweep();
                    },
                    None => break,
                }
            }
        })
    }

    /// Admit or reject one request from `client`
    ///
    /// Returns `true` when a token was taken. With the limiter disabled this
    /// always returns `true` and touches no state.
    pub fn allow(&self, client: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        let now = self.clock.now();
        let rate = self.config.requests_per_sec;
        let capacity = self.config.capacity();

        let admitted = match self.buckets.get_mut(client) {
            Some(mut bucket) => bucket.try_take(now, rate, capacity),
            None => self
                .buckets
                .entry(client.to_owned())
                .or_insert_with(|| ClientBucket::full(capacity, now))
                .try_take(now, rate, capacity),
        };

        if !admitted {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            metrics::REQUESTS_REJECTED.inc();
            debug!(client = client, "Request rejected by rate limiter");
        }

        admitted
    }

    /// Like [`allow`](Self::allow), reporting rejection as [`Error::AdmissionRejected`]
    pub fn check(&self, client: &str) -> Result<(), Error> {
        if self.allow(client) {
            Ok(())
        } else {
            Err(Error::AdmissionRejected {
                client: client.to_owned(),
            })
        }
    }

    /// Tokens available to `client` right now, without consuming any
    pub fn available(&self, client: &str) -> f64 {
        let now = self.clock.now();
        let rate = self.config.requests_per_sec;
        let capacity = self.config.capacity();

        match self.buckets.get_mut(client) {
            Some(mut bucket) => {
                bucket.refill(now, rate, capacity);
                bucket.tokens()
            },
            None => capacity,
        }
    }

    /// Remove buckets idle for longer than the configured TTL
    ///
    /// Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.config.bucket_ttl;
        let before = self.buckets.len();

        self.buckets.retain(|_, bucket| !bucket.is_idle(now, ttl));

        let after = self.buckets.len();
        metrics::RATE_LIMIT_BUCKETS.set(after as i64);

        let removed = before.saturating_sub(after);
        if removed > 0 {
            debug!(removed = removed, remaining = after, "Swept idle rate limit buckets");
        }
        removed
    }

    /// Number of client buckets currently tracked
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Get total number of rejections
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    /// Get statistics
    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            enabled: self.config.enabled,
            buckets: self.bucket_count(),
            total_rejections: self.total_rejections(),
            requests_per_sec: self.config.requests_per_sec,
            burst: self.config.burst,
        }
    }

    /// Get configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Rate limiter statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct RateLimitStats {
    /// Whether rate limiting is enabled
    pub enabled: bool,
    /// Number of tracked client buckets
    pub buckets: usize,
    /// Total number of rejected requests
    pub total_rejections: u64,
    /// Sustained rate per client
    pub requests_per_sec: f64,
    /// Burst capacity per client
    pub burst: u32,
}
