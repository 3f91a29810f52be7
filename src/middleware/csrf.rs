//! CSRF verification and session cookie middleware.
//!
//! # Verification
//!
//! State-changing requests (POST, PUT, PATCH, DELETE) to non-exempt paths
//! must present the session's current token in `X-CSRFToken`,
//! `X-CSRF-Token`, or a `csrf_token` field of an urlencoded form body.
//! The session is identified by the `session_id` cookie. Failures are 403
//! and the inner service never runs.
//!
//! # Issuance
//!
//! Safe requests to `/` ensure the client has a session cookie and a current
//! token. The token is placed in request extensions as a [`CsrfToken`] so a
//! page renderer can embed it.

use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::security::csrf::{CSRF_FORM_FIELD, CSRF_HEADER_NAMES, new_session_id};
use crate::security::{CsrfGuard, CsrfVerdict};

/// Name of the session cookie that binds tokens to a client.
pub const SESSION_COOKIE: &str = "session_id";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Attributes of the session cookie.
#[derive(Debug, Clone, Copy)]
pub struct SessionCookieConfig {
    pub secure: bool,
    pub lifetime: Duration,
}

impl SessionCookieConfig {
    fn render(&self, session_id: &str) -> String {
        let mut cookie = format!(
            "{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.lifetime.as_secs()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

/// Read the session id from `Cookie` headers.
pub fn session_from_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Token from the first non-empty CSRF header.
fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    CSRF_HEADER_NAMES.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with(FORM_CONTENT_TYPE))
}

/// Find the submitted token, buffering a form body if needed.
///
/// The request is rebuilt with the buffered bytes so handlers still see the
/// full body. Non-form bodies are never read here.
async fn extract_token(
    req: Request<Body>,
    body_limit: usize,
) -> Result<(Request<Body>, Option<String>), AppError> {
    if let Some(token) = token_from_headers(req.headers()) {
        return Ok((req, Some(token)));
    }
    if !is_form(req.headers()) {
        return Ok((req, None));
    }

    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, body_limit).await.map_err(|e| {
        AppError::CsrfVerificationFailed(format!("form body unreadable: {e}"))
    })?;
    let token = url::form_urlencoded::parse(&bytes)
        .find(|(name, _)| name == CSRF_FORM_FIELD)
        .map(|(_, value)| value.into_owned());

    Ok((Request::from_parts(parts, Body::from(bytes)), token))
}

/// CSRF layer for Tower middleware stack.
#[derive(Clone)]
pub struct CsrfLayer {
    guard: CsrfGuard,
    cookie: SessionCookieConfig,
    body_limit: usize,
}

impl CsrfLayer {
    pub fn new(guard: CsrfGuard, cookie: SessionCookieConfig, body_limit: usize) -> Self {
        Self {
            guard,
            cookie,
            body_limit,
        }
    }
}

impl<S> Layer<S> for CsrfLayer {
    type Service = CsrfService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CsrfService {
            inner,
            guard: self.guard.clone(),
            cookie: self.cookie,
            body_limit: self.body_limit,
        }
    }
}

/// CSRF service wrapper.
#[derive(Clone)]
pub struct CsrfService<S> {
    inner: S,
    guard: CsrfGuard,
    cookie: SessionCookieConfig,
    body_limit: usize,
}

impl<S> Service<Request<Body>> for CsrfService<S>
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
        let guard = self.guard.clone();
        let cookie = self.cookie;
        let body_limit = self.body_limit;
        let mut inner = self.inner.clone();

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let session = session_from_cookies(req.headers());

        if guard.requires_verification(&method, &path) {
            return Box::pin(async move {
                let (req, supplied) = match extract_token(req, body_limit).await {
                    Ok(found) => found,
                    Err(e) => return Ok(e.into_response()),
                };

                match guard.verify(session.as_deref(), supplied.as_deref()) {
                    CsrfVerdict::Valid => {
                        debug!(path = %path, "CSRF token verified");
                        inner.call(req).await
                    }
                    CsrfVerdict::Invalid(failure) => {
                        Ok(AppError::CsrfVerificationFailed(failure.to_string()).into_response())
                    }
                }
            });
        }

        if !matches!(method, Method::GET | Method::HEAD) || path != "/" {
            return Box::pin(async move { inner.call(req).await });
        }

        // Safe request to the index: make sure a session and token exist.
        Box::pin(async move {
            let (session_id, is_new) = match session {
                Some(id) => (id, false),
                None => (new_session_id(), true),
            };

            match guard.issue_token(&session_id) {
                Ok(token) => {
                    req.extensions_mut().insert(token);
                }
                Err(e) => return Ok(e.into_response()),
            }

            let mut response = inner.call(req).await?;

            if is_new {
                match HeaderValue::from_str(&cookie.render(&session_id)) {
                    Ok(value) => {
                        response.headers_mut().append(SET_COOKIE, value);
                    }
                    Err(e) => warn!(error = %e, "Could not encode session cookie"),
                }
            }

            Ok(response)
        })
    }
}
