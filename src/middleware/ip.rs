//! Client address resolution for rate limiting and brute-force tracking.
//!
//! # Resolution Order
//!
//! ```text
//!   ConnectInfo peer ──▶ peer in TRUSTED_PROXIES? ──yes──▶ X-Forwarded-For / X-Real-IP
//!        │                        │                              │ (unparseable)
//!        │                        no                             ▼
//!        │                        └─────────────────────────▶ peer address
//!        │
//!        └─ absent ──▶ proxy headers, else "unknown"
//! ```
//!
//! Forwarding headers are only believed when the connection comes from a
//! configured proxy. Anyone else could set them to rotate through spoofed
//! addresses and dodge the per-client limits, or to lock a victim's address
//! out of the brute-force guard.
//!
//! Even behind a trusted proxy the leftmost `X-Forwarded-For` entry is
//! whatever the client sent. The list is walked from the right and the first
//! address outside `TRUSTED_PROXIES` is taken as the client.
//!
//! The server is always started with `into_make_service_with_connect_info`,
//! so the peer address is present in production. It is missing only when the
//! router is driven directly (tests, embedding), which is why that case still
//! falls back to the headers.
//!
//! # The "unknown" Fallback
//!
//! When no address can be determined, all such requests share the
//! [`UNKNOWN_IP`] key and are limited collectively.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback key when no client address can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"` or a bare address (host route).
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (ip, prefix_len) = match cidr.split_once('/') {
            Some((ip, len)) => (ip.parse::<IpAddr>().ok()?, Some(len.parse::<u8>().ok()?)),
            None => (cidr.parse::<IpAddr>().ok()?, None),
        };

        let max_prefix = if ip.is_ipv4() { 32 } else { 128 };
        let prefix_len = prefix_len.unwrap_or(max_prefix);
        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network: ip,
            prefix_len,
        })
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Whether `ip` falls inside this range. Families never match each other.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix_len)).unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Reverse proxies whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy ranges configured");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `ip` belongs to a configured proxy. Nothing is trusted when
    /// no ranges are configured.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

/// Client address claimed by proxy headers.
///
/// `X-Forwarded-For` is read right to left: every proxy appends the address
/// it received the request from, so the first hop outside `proxies` is the
/// client and anything further left is client-supplied. An unparseable hop
/// ends the walk. Without a usable hop, `X-Real-IP` is used.
fn forwarded_ip<B>(req: &Request<B>, proxies: &TrustedProxyConfig) -> Option<IpAddr> {
    let headers = req.headers();
    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .collect();

    let mut nearest_proxy = None;
    for hop in hops.iter().rev() {
        match hop.trim().parse::<IpAddr>() {
            Ok(ip) if proxies.is_trusted(&ip) => nearest_proxy = Some(ip),
            Ok(ip) => return Some(ip),
            Err(_) => break,
        }
    }

    nearest_proxy.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    })
}

fn peer_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Rate-limit key for the client that sent `req`.
pub fn client_key<B>(req: &Request<B>, proxies: &TrustedProxyConfig) -> Cow<'static, str> {
    let resolved = match peer_ip(req) {
        Some(peer) if proxies.is_trusted(&peer) => Some(forwarded_ip(req, proxies).unwrap_or(peer)),
        Some(peer) => {
            if proxies.is_enabled() && req.headers().contains_key("x-forwarded-for") {
                debug!(peer = %peer, "Ignoring forwarding headers from untrusted peer");
            }
            Some(peer)
        }
        None => forwarded_ip(req, proxies),
    };

    match resolved {
        Some(ip) => Cow::Owned(ip.to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}
