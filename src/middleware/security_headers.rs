//! Security header middleware.
//!
//! Sits outside every rejecting layer so that 403, 404, 429 and redirect
//! responses carry the same header set as successful ones. A fresh
//! [`CspNonce`] is generated per request and inserted into request
//! extensions before the inner service runs; the same nonce is rendered into
//! the response's `Content-Security-Policy`.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use tower::{Layer, Service};

use super::client::RequestContext;
use crate::metrics;
use crate::security::{CspNonce, RouteScope, Scheme, SecurityHeaderPolicy};

/// Security header layer for Tower middleware stack.
#[derive(Clone)]
pub struct SecurityHeadersLayer {
    policy: Arc<SecurityHeaderPolicy>,
}

impl SecurityHeadersLayer {
    pub fn new(policy: SecurityHeaderPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for SecurityHeadersLayer {
    type Service = SecurityHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityHeadersService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Security header service wrapper.
#[derive(Clone)]
pub struct SecurityHeadersService<S> {
    inner: S,
    policy: Arc<SecurityHeaderPolicy>,
}

impl<S> Service<Request<Body>> for SecurityHeadersService<S>
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
        let policy = self.policy.clone();
        let mut inner = self.inner.clone();

        let (scheme, scope) = match req.extensions().get::<RequestContext>() {
            Some(context) => (context.scheme, RouteScope::for_path(&context.path)),
            None => (Scheme::Http, RouteScope::for_path(req.uri().path())),
        };

        let nonce = CspNonce::generate();
        req.extensions_mut().insert(nonce.clone());

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            policy.decorate(response.headers_mut(), scheme, &nonce);
            metrics::record_response(scope.name(), response.status().as_u16());
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::middleware::client::ProxyTrust;
    use axum::Router;
    use axum::extract::Extension;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    fn app() -> Router {
        Router::new()
            .route(
                "/nonce",
                get(|Extension(nonce): Extension<CspNonce>| async move { nonce.to_string() }),
            )
            .route(
                "/teapot",
                get(|| async { (StatusCode::IM_A_TEAPOT, [("server", "hyper")], "short") }),
            )
            .layer(SecurityHeadersLayer::new(SecurityHeaderPolicy::default()))
    }

    #[tokio::test]
    async fn test_nonce_in_extension_matches_header() {
        let res = app()
            .oneshot(Request::builder().uri("/nonce").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let csp = res
            .headers()
            .get("content-security-policy")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        let nonce = String::from_utf8(body.to_vec()).unwrap();

        assert!(csp.contains(&format!("'nonce-{nonce}'")));
    }

    #[tokio::test]
    async fn test_error_statuses_are_decorated() {
        let res = app()
            .oneshot(Request::builder().uri("/teapot").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
        assert!(res.headers().get("server").is_none());
        assert_eq!(res.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn test_hsts_follows_context_scheme() {
        let mut req = Request::builder()
            .uri("/teapot")
            .header("x-forwarded-proto", "https")
            .body(Body::empty())
            .unwrap();
        let context = RequestContext::resolve(&req, &ProxyTrust::default());
        req.extensions_mut().insert(context);

        let res = app().oneshot(req).await.unwrap();
        assert!(res.headers().get("strict-transport-security").is_some());

        let res = app()
            .oneshot(Request::builder().uri("/teapot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(res.headers().get("strict-transport-security").is_none());
    }
}
