//! HTTP middleware for the request security pipeline.
//!
//! - **Client Context**: resolves client key and scheme once per request
//! - **Security Headers**: CSP with per-response nonce, HSTS, framing and sniffing headers
//! - **Request ID**: generation and propagation for log correlation
//! - **HTTPS Redirect**: 302 to https when `FORCE_HTTPS` is on
//! - **Rate Limiting**: fixed-window, per-client, per-scope
//! - **CSRF**: token verification on state-changing requests, session cookie issue
//!
//! # Architecture
//!
//! ```text
//! Request → Context → Headers → Request ID → Trace → Rate Limit → HTTPS → CSRF → Handler
//!                        ↑                                 ↓         ↓       ↓
//!                        └──── decorates every ─────────  429       302     403
//!                              response on the way out
//! ```
//!
//! Every rejecting layer sits inside the header layer, so rejections carry the
//! same security headers as successful responses.

pub mod client;
pub mod csrf;
pub mod https_redirect;
pub mod rate_limit;
pub mod request_id;
pub mod security_headers;

pub use client::{CidrRange, ProxyTrust, RequestContext, UNKNOWN_CLIENT, attach_request_context};
pub use csrf::{CsrfLayer, SESSION_COOKIE, SessionCookieConfig};
pub use https_redirect::enforce_https;
pub use rate_limit::RateLimitLayer;
pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer};
pub use security_headers::SecurityHeadersLayer;
