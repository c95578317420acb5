//! Network admission control
//!
//! Per-client token bucket rate limiting and the client identity it is keyed on.

pub mod client;
pub mod rate_limit;

pub use client::{client_key, resolve_client};
pub use rate_limit::{ClientBucket, RateLimitConfig, RateLimitStats, RateLimiter};
