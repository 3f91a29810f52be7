//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │ Request Context  │ ← Client key + scheme from peer and trusted proxy headers
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ Security Headers │ ← CSP nonce, HSTS, nosniff, DENY (on every response)
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Adds X-Request-Id header
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if any applicable window is exhausted
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  HTTPS Redirect  │ ← 302 if FORCE_HTTPS and the request was plain http
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │      CSRF        │ ← 403 on state-changing requests without a valid token
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler        ← PathGuard: 403 traversal/extension, 404 missing
//! ```
//!
//! # Routes
//!
//! - `/` - Index document
//! - `/health` - Liveness (own rate-limit scope)
//! - `/{*path}` - Static assets

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers;
use crate::middleware::{
    CsrfLayer, ProxyTrust, RateLimitLayer, RequestIdLayer, SecurityHeadersLayer,
    SessionCookieConfig, attach_request_context, enforce_https,
};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// Layers are added innermost first; the last `.layer()` call runs first.
///
/// # Middleware Configuration
///
/// - **Rate Limiting**: Enabled if `RATE_LIMIT_ENABLED`
/// - **CSRF**: Enabled if `CSRF_ENABLED`
/// - **HTTPS Redirect**: Active if `FORCE_HTTPS`
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    let mut router = Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health_check))
        .route("/{*path}", get(handlers::serve_static));

    // =========================================================================
    // Apply Middleware Stack (innermost first)
    // =========================================================================

    // 1. Request body size limit
    info!(
        max_size_mb = config.max_request_body_size / (1024 * 1024),
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. CSRF (if enabled)
    if config.csrf_enabled {
        info!(
            exempt_paths = ?config.csrf_exempt_paths,
            time_limit_secs = config.csrf_time_limit.as_secs(),
            "CSRF protection enabled"
        );
        let cookie = SessionCookieConfig {
            secure: config.session_cookie_secure,
            lifetime: config.session_lifetime,
        };
        router = router.layer(CsrfLayer::new(
            state.csrf.clone(),
            cookie,
            config.max_request_body_size,
        ));
    } else {
        info!("CSRF protection disabled (CSRF_ENABLED=false)");
    }

    // 3. HTTPS redirect (redirects are counted by the limiter above it)
    if config.force_https {
        info!("Plain-http requests will be redirected to https");
    }
    router = router.layer(from_fn_with_state(config.force_https, enforce_https));

    // 4. Rate Limiting (if enabled)
    if config.rate_limit_enabled {
        info!(
            policy = ?state.rate_limiter.policy(),
            storage = %config.rate_limit_storage_url,
            "Rate limiting enabled"
        );
        router = router.layer(RateLimitLayer::new(state.rate_limiter.clone()));
    } else {
        info!("Rate limiting disabled (RATE_LIMIT_ENABLED=false)");
    }

    // 5. Tracing
    router = router.layer(TraceLayer::new_for_http());

    // 6. Request ID
    router = router.layer(RequestIdLayer::new());

    // 7. Security headers
    router = router.layer(SecurityHeadersLayer::new(state.header_policy.clone()));

    // 8. Request context (client key, scheme)
    let trust = Arc::new(ProxyTrust::new(
        config.trusted_proxy_hops,
        &config.trusted_proxies,
    ));
    info!(
        hops = trust.hops(),
        proxy_validation = config.proxy_validation_enabled(),
        trusted_proxies = config.trusted_proxies.len(),
        "Client identity resolution configured"
    );
    if config.environment.is_production()
        && trust.hops() > 0
        && !config.proxy_validation_enabled()
    {
        warn!(
            hops = trust.hops(),
            "X-Forwarded-For is trusted from any peer; set TRUSTED_PROXIES or TRUSTED_PROXY_HOPS=0 \
             unless every request arrives through a proxy"
        );
    }
    router = router.layer(from_fn_with_state(trust, attach_request_context));

    router.with_state(state)
}
