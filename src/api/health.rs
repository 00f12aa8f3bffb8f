//! Liveness endpoints for the front-door router.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use super::FrontState;

/// `GET /` — service identity probe.
pub async fn root() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "router" }))
}

/// `GET /health` — uptime and timestamp. No dependencies, never blocks.
pub async fn health(State(state): State<Arc<FrontState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
