//! The request security pipeline's policy components.
//!
//! Each component is a plain value with a pure (or filesystem-read-only)
//! decision function. None of them know about HTTP middleware; the tower
//! layers in [`crate::middleware`] call into them and map their decisions to
//! responses.
//!
//! - [`PathGuard`]: static-root containment and extension allow-listing
//! - [`RateLimiter`]: fixed-window, multi-scope per-client limiting
//! - [`SecurityHeaderPolicy`]: security header set with a per-response CSP nonce
//! - [`CsrfGuard`]: synchronizer token issue and verification

pub mod clock;
pub mod csrf;
pub mod headers;
pub mod path_guard;
pub mod rate_limiter;

pub use clock::{Clock, ManualClock, SystemClock};
pub use csrf::{CsrfFailure, CsrfGuard, CsrfToken, CsrfVerdict};
pub use headers::{CspNonce, CspPolicy, Scheme, SecurityHeaderPolicy, SecurityHeaderSet};
pub use path_guard::{AllowedExtensionSet, PathDecision, PathGuard, PathRejection, StaticAsset};
pub use rate_limiter::{
    InMemoryStore, RateDecision, RateLimit, RateLimitPolicy, RateLimitStore, RateLimiter,
    RouteScope,
};
