//! Route handlers and request/response mapping.

pub mod ai;
pub mod common;
pub mod events;
pub mod incidents;

use axum::Json;
use axum::extract::State;
use serde_json::json;

use crate::app::AppState;

/// Liveness plus a cheap load snapshot.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let telemetry = state.queue.telemetry();
    Json(json!({
        "status": "ok",
        "queueSize": telemetry.queue_size,
        "queueUtilization": telemetry.utilization,
        "underPressure": telemetry.under_pressure,
        "subscribers": state.hub.session_count(),
        "breaker": state.breaker.state().as_str(),
    }))
}
