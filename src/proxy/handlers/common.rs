//! Health and connectivity endpoints.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::constants;
use crate::models::key::KeyStatus;
use crate::proxy::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime: u64,
    pub keys: KeyHealthSummary,
}

#[derive(Debug, Default, Serialize)]
pub struct KeyHealthSummary {
    pub total: usize,
    pub active: usize,
    pub rate_limited: usize,
    pub disabled: usize,
}

/// GET /health.
pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut summary = KeyHealthSummary::default();
    for key in state.pool.snapshot() {
        summary.total += 1;
        match key.status {
            KeyStatus::Active if key.enabled => summary.active += 1,
            KeyStatus::Active => summary.disabled += 1,
            KeyStatus::RateLimited => summary.rate_limited += 1,
            KeyStatus::Disabled => summary.disabled += 1,
        }
    }

    let status = if summary.total == 0 || summary.active == 0 {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status,
        version: constants::VERSION,
        uptime: state.started_at.elapsed().as_secs(),
        keys: summary,
    })
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub message: &'static str,
    pub time: i64,
}

/// GET /ping.
pub async fn handle_ping() -> Json<PingResponse> {
    Json(PingResponse {
        message: "pong",
        time: Utc::now().timestamp(),
    })
}
