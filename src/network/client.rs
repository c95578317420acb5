//! Client identity for rate limiting
//!
//! IPv4 clients are keyed by their full address. IPv6 clients are keyed by
//! their /64 prefix so a host cannot dodge its budget by rotating addresses
//! inside its own subnet.

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Rate limit key for an IP address
pub fn client_key(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return v4.to_string();
            }
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:{:x}::/64", s[0], s[1], s[2], s[3])
        },
    }
}

/// Client IP as reported by a reverse proxy, if any
///
/// Takes the left-most `X-Forwarded-For` entry, then `X-Real-IP`.
/// Unparseable values are ignored.
pub fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let from_xff = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    from_xff.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    })
}

/// Resolve the rate limit key for a request
///
/// Proxy headers are consulted only when `trust_proxy_headers` is set.
/// Returns `None` when neither a trusted header nor the peer address is known.
pub fn resolve_client(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> Option<String> {
    let proxied = if trust_proxy_headers {
        forwarded_ip(headers)
    } else {
        None
    };

    proxied.or(peer.map(|addr| addr.ip())).map(client_key)
}
