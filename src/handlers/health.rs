//! Liveness endpoint.
//!
//! `GET /health` has its own rate-limit scope (10/minute by default) on top of
//! the global limits, and is exempt from CSRF verification.

use axum::Json;
use axum::extract::State;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "service": "portfolio-webapp"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::healthy(state.config.service_name.clone()))
}
