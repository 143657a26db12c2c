//! Pulse endpoints: create, inspect, and count pulses over the store.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use reeve_domain::pulse::{
    NewPulse, PulsePriority, StatusFilter, PROMPT_MAX_CHARS, PROMPT_MIN_CHARS,
};
use reeve_domain::timespec::parse_time_string;

use crate::state::AppState;
use crate::store::StoreError;

use super::api_error;

fn store_fault(e: StoreError) -> axum::response::Response {
    tracing::error!(error = %e, "store operation failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy", "service": "reeve" }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/pulse/schedule
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct SchedulePulseRequest {
    pub prompt: String,
    #[serde(default = "d_now")]
    pub scheduled_at: String,
    #[serde(default = "d_priority")]
    pub priority: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub sticky_notes: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// Stored as `created_by` for auditing.
    #[serde(default = "d_source")]
    pub source: String,
    #[serde(default = "d_max_retries")]
    pub max_retries: i32,
}

fn d_now() -> String {
    "now".to_string()
}
fn d_priority() -> String {
    "high".to_string()
}
fn d_source() -> String {
    "external".to_string()
}
fn d_max_retries() -> i32 {
    reeve_domain::pulse::DEFAULT_MAX_RETRIES
}

pub async fn schedule_pulse(
    State(state): State<AppState>,
    Json(req): Json<SchedulePulseRequest>,
) -> impl IntoResponse {
    let prompt_chars = req.prompt.chars().count();
    if !(PROMPT_MIN_CHARS..=PROMPT_MAX_CHARS).contains(&prompt_chars) {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "prompt must be {PROMPT_MIN_CHARS}-{PROMPT_MAX_CHARS} characters, got {prompt_chars}"
            ),
        );
    }

    let priority: PulsePriority = match req.priority.parse() {
        Ok(p) => p,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let scheduled_at = match parse_time_string(&req.scheduled_at) {
        Ok(t) => t,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let new = NewPulse {
        scheduled_at,
        prompt: req.prompt,
        priority,
        session_id: req.session_id,
        sticky_notes: req.sticky_notes,
        tags: req.tags,
        created_by: req.source,
        max_retries: req.max_retries,
    };

    match state.store.schedule(new).await {
        Ok(pulse_id) => {
            tracing::info!(pulse_id, priority = %priority, "pulse scheduled via API");
            Json(serde_json::json!({
                "pulse_id": pulse_id,
                "scheduled_at": reeve_domain::pulse::rfc3339(&scheduled_at),
                "message": "Pulse scheduled successfully",
            }))
            .into_response()
        }
        Err(e) => store_fault(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/pulse/upcoming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct UpcomingQuery {
    #[serde(default = "d_limit")]
    pub limit: i64,
}

fn d_limit() -> i64 {
    20
}

pub async fn upcoming(
    State(state): State<AppState>,
    Query(query): Query<UpcomingQuery>,
) -> impl IntoResponse {
    if !(1..=100).contains(&query.limit) {
        return api_error(StatusCode::BAD_REQUEST, "limit must be between 1 and 100");
    }
    match state.store.get_upcoming(query.limit, &[]).await {
        Ok(pulses) => {
            let views: Vec<_> = pulses.iter().map(|p| p.to_summary()).collect();
            Json(serde_json::json!({ "pulses": views, "count": views.len() })).into_response()
        }
        Err(e) => store_fault(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/pulse/list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "d_status")]
    pub status: String,
    #[serde(default = "d_limit")]
    pub limit: i64,
}

fn d_status() -> String {
    "pending".to_string()
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    if !(1..=100).contains(&query.limit) {
        return api_error(StatusCode::BAD_REQUEST, "limit must be between 1 and 100");
    }
    let filter: StatusFilter = match query.status.parse() {
        Ok(f) => f,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.store.get_by_status(filter, query.limit).await {
        Ok(pulses) => {
            let views: Vec<_> = pulses.iter().map(|p| p.to_summary()).collect();
            Json(serde_json::json!({
                "pulses": views,
                "count": views.len(),
                "status": query.status,
            }))
            .into_response()
        }
        Err(e) => store_fault(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/pulse/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_pulse(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.get(id).await {
        Ok(Some(pulse)) => Json(pulse.to_view()).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("pulse {id} not found")),
        Err(e) => store_fault(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/pulse/stats, GET /api/stats, GET /api/status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn queue_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_fault(e),
    }
}

pub async fn execution_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.execution_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_fault(e),
    }
}

pub async fn daemon_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "running",
        "database": state.config.db_path.display().to_string(),
        "desk_path": state.config.desk_path.display().to_string(),
        "api_port": state.config.api_port,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
