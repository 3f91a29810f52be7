//! Rate limiting middleware over the fixed-window [`RateLimiter`].
//!
//! # Scopes
//!
//! The route scope is derived from the path recorded in the
//! [`RequestContext`] ([`RouteScope::for_path`]), so requests for paths without a route still
//! count against the static-asset budget.
//!
//! # Response Headers
//!
//! On rate limit exceeded (429):
//! - `Retry-After`: Seconds until the nearest failing window resets
//! - `X-RateLimit-Limit`: Request count of the failing limit
//! - `X-RateLimit-Remaining`: Always `0`
//!
//! # Client Identity
//!
//! The key comes from the [`RequestContext`] resolved by the outermost layer.
//! See [`super::client`] for how forwarded headers are trusted.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;

use super::client::{RequestContext, UNKNOWN_CLIENT};
use crate::error::AppError;
use crate::metrics;
use crate::security::{RateDecision, RateLimiter, RouteScope};

/// Rate limiting layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = RateLimiter::new(RateLimitPolicy::default());
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(RateLimitLayer::new(limiter));
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: RateLimiter,
}

impl RateLimitLayer {
    pub fn new(limiter: RateLimiter) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: RateLimiter,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let mut inner = self.inner.clone();

        let (client, path): (Arc<str>, String) = match req.extensions().get::<RequestContext>() {
            Some(context) => (context.client_key.clone(), context.path.clone()),
            None => (Arc::from(UNKNOWN_CLIENT), req.uri().path().to_string()),
        };
        let scope = RouteScope::for_path(&path);

        Box::pin(async move {
            match limiter.check(&client, scope) {
                RateDecision::Admit => inner.call(req).await,
                RateDecision::Deny {
                    retry_after_secs,
                    limit,
                } => {
                    warn!(
                        client = %client,
                        path = %path,
                        scope = scope.name(),
                        retry_after_secs,
                        "Rate limit exceeded for client"
                    );
                    metrics::record_rate_limited(scope.name());

                    Ok(AppError::RateLimitExceeded {
                        scope: scope.name(),
                        limit,
                        retry_after_secs,
                    }
                    .into_response())
                }
            }
        })
    }
}
