//! Client identity and request context resolution.
//!
//! The outermost middleware resolves who the client is and which scheme the
//! original request used, exactly once per request, and stores the result as
//! a [`RequestContext`] extension. Every later layer (rate limiting, headers,
//! HTTPS redirect) reads that value instead of re-parsing headers.
//!
//! # Forwarded Headers
//!
//! With `TRUSTED_PROXY_HOPS = n`, the server assumes exactly `n` reverse
//! proxies, each appending to `X-Forwarded-For`. The client is therefore the
//! `n`-th entry from the **right**: entries further left were supplied by the
//! client itself and can be forged. `X-Forwarded-Proto` is read the same way.
//!
//! If the header has fewer than `n` entries, or `TRUSTED_PROXIES` is set and
//! the direct peer is not inside one of its ranges, forwarded headers are
//! ignored and the socket peer address is used.
//!
//! # The "unknown" Fallback
//!
//! When neither a forwarded entry nor a peer address is available, all such
//! requests share the `"unknown"` key and are rate-limited collectively.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

use crate::security::Scheme;

/// Client key shared by requests whose origin cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range for trusted proxy validation.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `10.0.0.0/8`, `::1/128`, or a bare address (implicit /32 or /128).
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = match cidr.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr.trim(), None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max_prefix)?,
            None => max_prefix,
        };

        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix_len))
                    .unwrap_or(0);
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Which peers may supply forwarded headers, and how many hops to trust.
#[derive(Debug, Clone)]
pub struct ProxyTrust {
    hops: usize,
    ranges: Vec<CidrRange>,
}

impl Default for ProxyTrust {
    fn default() -> Self {
        Self::new(1, &[])
    }
}

impl ProxyTrust {
    /// Invalid CIDR strings are logged and skipped.
    pub fn new(hops: usize, cidrs: &[String]) -> Self {
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

        Self { hops, ranges }
    }

    pub fn hops(&self) -> usize {
        self.hops
    }

    /// Whether forwarded headers from this peer may be honored.
    ///
    /// With no ranges configured every peer qualifies; with ranges, an
    /// unknown peer never does.
    pub fn is_trusted_peer(&self, peer: Option<IpAddr>) -> bool {
        if self.ranges.is_empty() {
            return true;
        }
        peer.is_some_and(|ip| self.ranges.iter().any(|range| range.contains(&ip)))
    }

    /// Entry `hops` from the right of a comma-separated forwarded header.
    fn forwarded_entry(&self, headers: &HeaderMap, name: &str) -> Option<String> {
        if self.hops == 0 {
            return None;
        }

        // Repeated headers are treated as one comma-joined list.
        let entries: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();

        let index = entries.len().checked_sub(self.hops)?;
        entries.get(index).map(|v| (*v).to_string())
    }

    /// Resolve the rate-limit key for a request.
    pub fn client_key(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> String {
        if self.is_trusted_peer(peer)
            && let Some(forwarded) = self.forwarded_entry(headers, X_FORWARDED_FOR)
        {
            return forwarded;
        }

        if headers.contains_key(X_FORWARDED_FOR) && !self.is_trusted_peer(peer) {
            debug!(
                peer = ?peer,
                "Ignoring X-Forwarded-For from untrusted peer"
            );
        }

        peer.map_or_else(|| UNKNOWN_CLIENT.to_string(), |ip| ip.to_string())
    }

    /// Resolve the scheme the client used to reach the outermost proxy.
    pub fn scheme(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Scheme {
        if self.is_trusted_peer(peer)
            && let Some(proto) = self.forwarded_entry(headers, X_FORWARDED_PROTO)
            && let Some(scheme) = Scheme::parse(&proto)
        {
            return scheme;
        }
        Scheme::Http
    }
}

// =============================================================================
// Request Context
// =============================================================================

/// Per-request snapshot resolved once by [`attach_request_context`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request path, without the query string.
    pub path: String,
    pub client_key: Arc<str>,
    pub scheme: Scheme,
}

impl RequestContext {
    pub fn resolve(req: &Request, trust: &ProxyTrust) -> Self {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let headers = req.headers();

        Self {
            path: req.uri().path().to_string(),
            client_key: Arc::from(trust.client_key(headers, peer)),
            scheme: trust.scheme(headers, peer),
        }
    }
}

/// Middleware that attaches a [`RequestContext`] to the request.
///
/// A context already present is kept, so nested routers resolve only once.
pub async fn attach_request_context(
    State(trust): State<Arc<ProxyTrust>>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.extensions().get::<RequestContext>().is_none() {
        let context = RequestContext::resolve(&request, &trust);
        debug!(
            client = %context.client_key,
            scheme = %context.scheme,
            path = %context.path,
            "Resolved request context"
        );
        request.extensions_mut().insert(context);
    }

    next.run(request).await
}
