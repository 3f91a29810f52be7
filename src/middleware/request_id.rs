//! Request ID middleware for log correlation.
//!
//! # Features
//!
//! - Generates UUIDv4 request IDs for incoming requests without a usable one
//! - Propagates a client-supplied `X-Request-Id` only if it is short and
//!   printable, so it can be logged verbatim without injecting log lines
//! - Adds `X-Request-Id` to all responses, including rejections
//! - Records the ID on the current tracing span
//!
//! # Client Usage
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:5000/health
//! ```

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{Span, debug};
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied ID that is propagated.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Request ID layer for Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

/// Request ID service wrapper.
#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = accepted_or_generated_request_id(&req);

        // Replaces any rejected client value.
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, request_id.clone());

        let id_str = request_id.to_str().unwrap_or_default();
        Span::current().record("request_id", id_str);
        debug!(request_id = %id_str, "Processing request");

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
            Ok(response)
        })
    }
}

fn is_acceptable_request_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

/// Keep a well-formed client ID, otherwise mint a UUIDv4.
fn accepted_or_generated_request_id<B>(req: &Request<B>) -> HeaderValue {
    if let Some(header_value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && is_acceptable_request_id(value)
    {
        return header_value.clone();
    }

    let generated = Uuid::new_v4().to_string();
    HeaderValue::from_str(&generated).unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_well_formed_request_id() {
        let req = Request::builder()
            .header("x-request-id", "edge-7f3a:42")
            .body(Body::empty())
            .unwrap();

        assert_eq!(accepted_or_generated_request_id(&req), "edge-7f3a:42");
    }

    #[test]
    fn test_generates_when_absent() {
        let req = Request::builder().body(Body::empty()).unwrap();
        let id = accepted_or_generated_request_id(&req);
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_replaces_unsafe_request_id() {
        let long = "x".repeat(200);
        for bad in ["has space", "quote\"d", "semi;colon", long.as_str()] {
            let req = Request::builder()
                .header("x-request-id", bad)
                .body(Body::empty())
                .unwrap();
            let id = accepted_or_generated_request_id(&req);
            assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok(), "{bad}");
        }
    }
}
