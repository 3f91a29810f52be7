use axum::http::StatusCode;
use axum::http::header::{HeaderValue, RETRY_AFTER};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::metrics;

/// Application-wide error types with their fixed HTTP status codes.
///
/// Every variant except `InternalFault` and `ConfigError` is an expected,
/// policy-driven outcome. The guards return plain decision values
/// (`PathDecision`, `RateDecision`, `CsrfVerdict`) and the pipeline converts
/// failing decisions into one of these variants.
///
/// # Status Mapping
///
/// | Variant                  | Status |
/// |--------------------------|--------|
/// | `TraversalAttempt`       | 403    |
/// | `DisallowedExtension`    | 403    |
/// | `CsrfVerificationFailed` | 403    |
/// | `ResourceNotFound`       | 404    |
/// | `RateLimitExceeded`      | 429    |
/// | `InternalFault`          | 500    |
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Path traversal attempt: {0}")]
    TraversalAttempt(String),

    #[error("Disallowed file extension requested: {0}")]
    DisallowedExtension(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Rate limit exceeded for scope {scope}, retry after {retry_after_secs}s")]
    RateLimitExceeded {
        scope: &'static str,
        limit: u32,
        retry_after_secs: u64,
    },

    #[error("CSRF verification failed: {0}")]
    CsrfVerificationFailed(String),

    #[error("Internal fault: {0}")]
    InternalFault(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AppError {
    /// HTTP status this error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::TraversalAttempt(_)
            | AppError::DisallowedExtension(_)
            | AppError::CsrfVerificationFailed(_) => StatusCode::FORBIDDEN,
            AppError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::InternalFault(_) | AppError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable kind, used for the response body and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            // Both path rejections render identically so clients cannot tell them apart.
            AppError::TraversalAttempt(_) | AppError::DisallowedExtension(_) => "forbidden",
            AppError::CsrfVerificationFailed(_) => "csrf_failed",
            AppError::ResourceNotFound(_) => "not_found",
            AppError::RateLimitExceeded { .. } => "rate_limited",
            AppError::InternalFault(_) | AppError::ConfigError(_) => "internal_error",
        }
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Full detail goes to the server log only; clients get the generic message.
        let message = match &self {
            AppError::TraversalAttempt(path) => {
                tracing::warn!(path = %path, "Directory traversal attempt");
                metrics::record_security_rejection("traversal");
                "Forbidden"
            }
            AppError::DisallowedExtension(path) => {
                tracing::warn!(path = %path, "Unauthorized file type requested");
                metrics::record_security_rejection("extension");
                "Forbidden"
            }
            AppError::CsrfVerificationFailed(reason) => {
                tracing::warn!(reason = %reason, "CSRF verification failed");
                metrics::record_security_rejection("csrf");
                "Forbidden"
            }
            AppError::ResourceNotFound(path) => {
                tracing::warn!(path = %path, "Resource not found");
                "Page not found"
            }
            AppError::RateLimitExceeded {
                scope,
                retry_after_secs,
                ..
            } => {
                tracing::warn!(scope, retry_after_secs, "Rate limit exceeded");
                "Rate limit exceeded. Please retry later."
            }
            AppError::InternalFault(_) | AppError::ConfigError(_) => {
                tracing::error!(error = %self, "Request failed");
                "Internal server error"
            }
        };

        let body = ErrorResponse {
            error: self.kind(),
            message,
        };
        let mut response = (self.status(), axum::Json(body)).into_response();

        if let AppError::RateLimitExceeded {
            limit,
            retry_after_secs,
            ..
        } = self
        {
            let headers = response.headers_mut();
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        }

        response
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
