//! Incident read and operator-action endpoints.

use std::str::FromStr;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use opspulse_broadcast::IncidentAction;
use opspulse_core::{IncidentId, IncidentStatus};
use opspulse_store::{IncidentFilter, IncidentPatch, IncidentSort};

use crate::app::AppState;
use crate::error::{ApiError, FieldError};
use crate::routes::common;

/// Cap on populated events when returning a single incident.
const MAX_POPULATED_EVENTS: usize = 500;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentListQuery {
    status: Option<String>,
    min_severity: Option<String>,
    service: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    page: Option<String>,
    limit: Option<String>,
    sort: Option<String>,
}

fn parse_status(raw: &Option<String>, errors: &mut Vec<FieldError>) -> Option<IncidentStatus> {
    let raw = raw.as_deref()?;
    match IncidentStatus::from_str(raw) {
        Ok(status) => Some(status),
        Err(_) => {
            errors.push(FieldError::new(
                "status",
                "expected one of: active, investigating, resolved",
                json!(raw),
            ));
            None
        }
    }
}

fn parse_incident_sort(raw: &Option<String>, errors: &mut Vec<FieldError>) -> IncidentSort {
    match raw.as_deref() {
        None | Some("-createdAt") => IncidentSort::CreatedDesc,
        Some("createdAt") => IncidentSort::CreatedAsc,
        Some("-severityScore") => IncidentSort::SeverityDesc,
        Some("-updatedAt") => IncidentSort::UpdatedDesc,
        Some(other) => {
            errors.push(FieldError::new(
                "sort",
                "expected one of: createdAt, -createdAt, -severityScore, -updatedAt",
                json!(other),
            ));
            IncidentSort::CreatedDesc
        }
    }
}

/// GET /incidents
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<IncidentListQuery>,
) -> Result<Response, ApiError> {
    let mut errors = Vec::new();
    let filter = IncidentFilter {
        status: parse_status(&query.status, &mut errors),
        min_severity: common::parse_severity("minSeverity", &query.min_severity, &mut errors),
        service: query.service.clone(),
        start: common::parse_date("startDate", &query.start_date, &mut errors),
        end: common::parse_date("endDate", &query.end_date, &mut errors),
    };
    let pagination = common::parse_pagination(&query.page, &query.limit, &mut errors);
    let sort = parse_incident_sort(&query.sort, &mut errors);
    common::fail_if_invalid(errors)?;

    let page = state
        .incidents
        .list_incidents(&filter, pagination, sort)
        .await?;
    Ok(Json(page).into_response())
}

/// GET /incidents/active: open incidents, most severe first.
pub async fn active(State(state): State<AppState>) -> Result<Response, ApiError> {
    let incidents = state.incidents.active().await?;
    Ok(Json(incidents).into_response())
}

/// GET /incidents/:id: incident with its events populated.
pub async fn get_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = IncidentId::from_str(&id)
        .map_err(|_| ApiError::validation_one("id", "invalid incident id", json!(id)))?;
    let incident = state
        .incidents
        .get_incident(id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let events = state
        .events
        .find_by_ids(&incident.event_ids, MAX_POPULATED_EVENTS)
        .await?;

    let mut body = serde_json::to_value(&incident)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Some(map) = body.as_object_mut() {
        map.insert(
            "events".to_string(),
            serde_json::to_value(&events).map_err(|e| ApiError::Internal(e.to_string()))?,
        );
    }
    Ok(Json(body).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentUpdateRequest {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    assigned_to: Option<String>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    root_cause: Option<String>,
}

/// PATCH /incidents/:id: operator actions.
///
/// Setting `status=resolved` stamps `resolvedAt`; setting `assignedTo`
/// stamps `acknowledgedAt` on first assignment. Both happen in the store's
/// patch application.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<IncidentUpdateRequest>,
) -> Result<Response, ApiError> {
    let id = IncidentId::from_str(&id)
        .map_err(|_| ApiError::validation_one("id", "invalid incident id", json!(id)))?;

    let mut errors = Vec::new();
    let status = parse_status(&body.status, &mut errors);
    if let Some(operator) = body.assigned_to.as_deref() {
        if operator.trim().is_empty() {
            errors.push(FieldError::new(
                "assignedTo",
                "expected a non-empty string",
                json!(operator),
            ));
        }
    }
    common::fail_if_invalid(errors)?;

    let patch = IncidentPatch {
        status,
        assigned_to: body.assigned_to,
        resolution: body.resolution,
        root_cause: body.root_cause,
        ..Default::default()
    };
    if patch.is_empty() {
        return Err(ApiError::validation_one(
            "body",
            "at least one of status, assignedTo, resolution, rootCause is required",
            serde_json::Value::Null,
        ));
    }

    let updated = state
        .incidents
        .update(id, &patch)
        .await?
        .ok_or(ApiError::NotFound)?;

    let action = if status == Some(IncidentStatus::Resolved) {
        IncidentAction::Resolved
    } else {
        IncidentAction::Updated
    };
    state.hub.publish_incident(&updated, action);

    Ok(Json(updated).into_response())
}
