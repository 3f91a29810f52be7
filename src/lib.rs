//! # static_shield
//!
//! A hardened static-asset edge server built on Axum. Every request passes an
//! ordered security pipeline before a file is read:
//!
//! - **Path containment**: lexical traversal checks, extension allowlist, and
//!   canonical-path containment inside the static root (symlinks included)
//! - **Rate limiting**: fixed-window limits per client and route scope, with a
//!   global budget shared by index and asset routes
//! - **Security headers**: CSP with a per-response nonce, HSTS on https,
//!   framing and sniffing protection, on every response including errors
//! - **CSRF**: signed single-use tokens bound to a `session_id` cookie,
//!   verified on state-changing requests
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Context → Headers → Request ID → Trace →       │
//! │              Rate Limit → HTTPS → CSRF)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (index, health, static assets)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Security (PathGuard, RateLimiter, CsrfGuard, HeaderPolicy) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Static root on the local filesystem                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use static_shield::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state);
//!
//!     // Serve with `into_make_service_with_connect_info::<SocketAddr>()`...
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! Production requires a signing key:
//! ```bash
//! APP_ENV=production SECRET_KEY=change-me STATIC_ROOT=./public cargo run
//! ```
//!
//! Tighten limits:
//! ```bash
//! RATE_LIMIT_DEFAULT="100 per day, 20 per hour" RATE_LIMIT_STATIC="50/minute" cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod security;
pub mod state;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use security::{CsrfGuard, PathGuard, RateLimiter, SecurityHeaderPolicy};
pub use state::AppState;
