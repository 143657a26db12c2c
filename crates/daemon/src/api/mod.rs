//! HTTP ingress — the authenticated REST surface over the store.
//!
//! - `GET  /api/health`          — liveness, no auth
//! - `POST /api/pulse/schedule`  — create a pulse
//! - `GET  /api/pulse/upcoming`  — pending pulses, soonest first
//! - `GET  /api/pulse/list`      — filtered listing
//! - `GET  /api/pulse/stats`     — queue counters
//! - `GET  /api/pulse/:id`       — full pulse record
//! - `GET  /api/stats`           — 7-day execution stats
//! - `GET  /api/status`          — daemon status

pub mod auth;
pub mod pulses;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Standardized JSON error response: `{ "error": "<message>" }`.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Build the full API router. Everything except `/api/health` sits behind
/// the bearer-token middleware.
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/api/health", get(pulses::health));

    let protected = Router::new()
        .route("/api/pulse/schedule", post(pulses::schedule_pulse))
        .route("/api/pulse/upcoming", get(pulses::upcoming))
        .route("/api/pulse/list", get(pulses::list))
        .route("/api/pulse/stats", get(pulses::queue_stats))
        .route("/api/pulse/:id", get(pulses::get_pulse))
        .route("/api/stats", get(pulses::execution_stats))
        .route("/api/status", get(pulses::daemon_status))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_token,
        ));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
