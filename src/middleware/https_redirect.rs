//! Plain-http to https redirect.
//!
//! Active only when `FORCE_HTTPS` is on. The scheme is taken from the
//! [`RequestContext`], so behind a TLS-terminating proxy the decision follows
//! `X-Forwarded-Proto` rather than the proxy-to-server hop.

use axum::extract::{Request, State};
use axum::http::header::{HOST, LOCATION};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use super::client::RequestContext;
use crate::security::Scheme;

/// Middleware redirecting plain-http requests with `302 Found`.
///
/// Requests without a usable `Host` header are passed through unchanged.
pub async fn enforce_https(
    State(force_https): State<bool>,
    request: Request,
    next: Next,
) -> Response {
    let scheme = request
        .extensions()
        .get::<RequestContext>()
        .map_or(Scheme::Http, |context| context.scheme);

    if !force_https || scheme.is_https() {
        return next.run(request).await;
    }

    let Some(host) = request.headers().get(HOST).and_then(|h| h.to_str().ok()) else {
        warn!("Cannot redirect to https without a Host header");
        return next.run(request).await;
    };

    let target = format!(
        "https://{host}{}",
        request
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
    );

    match HeaderValue::from_str(&target) {
        Ok(location) => {
            debug!(location = %target, "Redirecting to https");
            (StatusCode::FOUND, [(LOCATION, location)]).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Could not build https redirect location");
            next.run(request).await
        }
    }
}
