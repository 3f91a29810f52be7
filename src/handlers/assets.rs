//! Root document and static asset endpoints.
//!
//! # Endpoints
//!
//! - `GET /` - The configured index document (`INDEX_FILE`)
//! - `GET /{*path}` - Any file under the static root that passes `PathGuard`
//!
//! # Index Placeholders
//!
//! The index document is an HTML file that may reference the per-response
//! values produced by the middleware stack:
//!
//! - `{{ csp_nonce }}` - the nonce in this response's `script-src`
//! - `{{ csrf_token }}` - the session's current CSRF token (empty when CSRF is off)
//!
//! Other assets are served byte for byte.

use axum::extract::{Path, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use tracing::{debug, instrument};

use crate::error::AppResult;
use crate::security::{CspNonce, CsrfToken, StaticAsset};
use crate::state::AppState;

const NONCE_PLACEHOLDER: &str = "{{ csp_nonce }}";
const CSRF_PLACEHOLDER: &str = "{{ csrf_token }}";

/// Serve the root document.
#[instrument(skip(state, request))]
pub async fn index(State(state): State<AppState>, request: Request) -> AppResult<Response> {
    let asset = state.path_guard.fetch(&state.config.index_file).await?;

    let nonce = request.extensions().get::<CspNonce>();
    let token = request.extensions().get::<CsrfToken>();

    let asset = render_placeholders(asset, nonce, token);
    Ok(asset_response(asset))
}

/// Serve a static asset.
#[instrument(skip(state))]
pub async fn serve_static(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> AppResult<Response> {
    let asset = state.path_guard.fetch(&path).await?;
    debug!(path = %path, bytes = asset.bytes.len(), "Serving static asset");
    Ok(asset_response(asset))
}

fn asset_response(asset: StaticAsset) -> Response {
    ([(CONTENT_TYPE, asset.content_type)], asset.bytes).into_response()
}

/// Fill index placeholders. Non-HTML or non-UTF-8 documents are left untouched.
fn render_placeholders(
    mut asset: StaticAsset,
    nonce: Option<&CspNonce>,
    token: Option<&CsrfToken>,
) -> StaticAsset {
    if !asset.content_type.starts_with("text/html") {
        return asset;
    }
    let Ok(text) = std::str::from_utf8(&asset.bytes) else {
        return asset;
    };
    if !text.contains(NONCE_PLACEHOLDER) && !text.contains(CSRF_PLACEHOLDER) {
        return asset;
    }

    let rendered = text
        .replace(NONCE_PLACEHOLDER, nonce.map_or("", CspNonce::as_str))
        .replace(CSRF_PLACEHOLDER, token.map_or("", CsrfToken::as_str));
    asset.bytes = rendered.into_bytes();
    asset
}
