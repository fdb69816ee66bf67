//! AI summarization triggers and circuit-breaker admin.

use std::str::FromStr;

use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use opspulse_core::IncidentId;
use opspulse_workers::SummarizeError;

use crate::app::AppState;
use crate::error::ApiError;

/// POST /ai/summarize/:id: manual, single-incident summarization.
pub async fn summarize(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = IncidentId::from_str(&id)
        .map_err(|_| ApiError::validation_one("id", "invalid incident id", json!(id)))?;

    match state.summarizer.summarize_one(id).await {
        Ok(incident) => Ok(Json(incident).into_response()),
        Err(SummarizeError::NotFound) => Err(ApiError::NotFound),
        Err(SummarizeError::BreakerOpen { retry_after }) => Err(ApiError::ExternalUnavailable {
            retry_after_secs: Some(retry_after.as_secs().max(1)),
        }),
        Err(SummarizeError::Store(err)) => Err(err.into()),
    }
}

/// GET /ai/circuit-breaker: state plus recent transitions.
pub async fn breaker_status(State(state): State<AppState>) -> Response {
    Json(state.breaker.snapshot()).into_response()
}

/// POST /ai/circuit-breaker/reset: force the breaker closed.
pub async fn breaker_reset(State(state): State<AppState>) -> Response {
    state.breaker.reset();
    tracing::info!("circuit breaker manually reset");
    Json(state.breaker.snapshot()).into_response()
}
