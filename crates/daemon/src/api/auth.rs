//! API authentication middleware.
//!
//! `PULSE_API_TOKEN` is read once at startup and cached as a SHA-256
//! digest in [`AppState`](crate::state::AppState). Every protected request
//! must carry `Authorization: Bearer <token>`:
//! - missing header → 401
//! - wrong token → 403
//! - token not configured at all → 500 (the ingress never runs open)

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

use super::api_error;

/// Axum middleware enforcing bearer-token auth on protected routes.
/// Attach via `axum::middleware::from_fn_with_state`.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected_hash) = &state.api_token_hash else {
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "PULSE_API_TOKEN is not configured",
        )
        .into_response();
    };

    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = bearer else {
        return api_error(StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };

    // Compare fixed-length digests in constant time; the token length
    // never leaks.
    let provided_hash = Sha256::digest(token.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return api_error(StatusCode::FORBIDDEN, "invalid API token").into_response();
    }

    next.run(req).await
}
