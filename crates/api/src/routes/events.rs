//! Event ingestion and read endpoints.

use std::net::SocketAddr;
use std::str::FromStr;

use axum::Json;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use opspulse_core::{Event, EventId, Severity};
use opspulse_queue::{Enqueue, RejectReason};
use opspulse_store::{EventFilter, EventSort};

use crate::app::AppState;
use crate::error::{ApiError, FieldError};
use crate::rate_limit::{RateLimitDecision, client_id};
use crate::routes::common;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    severity: Option<i64>,
    #[serde(default)]
    metadata: Option<JsonValue>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    raw_payload: Option<JsonValue>,
}

/// Load level surfaced on every ingest response.
fn load_level(utilization: f64) -> &'static str {
    if utilization >= 0.90 {
        "critical"
    } else if utilization >= 0.70 {
        "warning"
    } else {
        "normal"
    }
}

/// Stamp admission-gate headers onto a response.
fn with_ingest_headers(
    mut response: Response,
    decision: &RateLimitDecision,
    utilization: f64,
) -> Response {
    let headers = response.headers_mut();
    let mut set = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    set("x-load-level", load_level(utilization).to_string());
    set(
        "x-queue-utilization",
        format!("{}%", (utilization * 100.0).round() as u32),
    );
    set("x-ratelimit-limit", decision.limit.to_string());
    set("x-ratelimit-remaining", decision.remaining.to_string());
    set("x-ratelimit-reset", decision.reset_secs.to_string());
    response
}

fn validate(body: IngestRequest) -> Result<Event, ApiError> {
    let mut errors = Vec::new();

    let service = match body.service.as_deref().map(str::trim) {
        Some(service) if !service.is_empty() && service.len() <= 128 => service.to_string(),
        Some(service) => {
            errors.push(FieldError::new(
                "service",
                "expected a non-empty string of at most 128 characters",
                json!(service),
            ));
            String::new()
        }
        None => {
            errors.push(FieldError::new("service", "required", JsonValue::Null));
            String::new()
        }
    };

    let severity = match body.severity {
        Some(raw) if (1..=5).contains(&raw) => Severity::clamped(raw),
        Some(raw) => {
            errors.push(FieldError::new(
                "severity",
                "expected an integer between 1 and 5",
                json!(raw),
            ));
            Severity::MIN
        }
        None => {
            errors.push(FieldError::new("severity", "required", JsonValue::Null));
            Severity::MIN
        }
    };

    let mut metadata = match body.metadata {
        None | Some(JsonValue::Null) => json!({}),
        Some(value @ JsonValue::Object(_)) => value,
        Some(other) => {
            errors.push(FieldError::new(
                "metadata",
                "expected a JSON object",
                other,
            ));
            json!({})
        }
    };
    if let Some(raw_payload) = body.raw_payload {
        if let Some(map) = metadata.as_object_mut() {
            map.insert("rawPayload".to_string(), raw_payload);
        }
    }

    common::fail_if_invalid(errors)?;

    let mut event = Event::new(service, severity, metadata);
    if let Some(tags) = body.tags {
        event = event.with_tags(tags);
    }
    Ok(event)
}

/// POST /events. The admission gate: rate limit first, then queue pressure.
pub async fn ingest(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<IngestRequest>,
) -> Response {
    let client = client_id(&headers, addr);
    let decision = state.limiter.check(&client);
    let utilization = state.queue.utilization();

    if !decision.allowed {
        let rejection = ApiError::RateLimited {
            retry_after_secs: decision.reset_secs,
        };
        return with_ingest_headers(rejection.into_response(), &decision, utilization);
    }

    let event = match validate(body) {
        Ok(event) => event,
        Err(err) => return with_ingest_headers(err.into_response(), &decision, utilization),
    };

    // Hard gate ahead of the queue's own bound.
    if utilization >= 0.90 {
        let rejection = ApiError::Overloaded { retry_after_secs: 5 };
        return with_ingest_headers(rejection.into_response(), &decision, utilization);
    }

    match state.queue.enqueue(event.clone()) {
        Enqueue::Accepted { .. } => {
            let response = (StatusCode::CREATED, Json(event)).into_response();
            with_ingest_headers(response, &decision, state.queue.utilization())
        }
        Enqueue::Rejected { reason, .. } => {
            let retry_after_secs = match reason {
                RejectReason::QueueFull | RejectReason::ShuttingDown => 5,
            };
            let rejection = ApiError::Overloaded { retry_after_secs };
            with_ingest_headers(rejection.into_response(), &decision, state.queue.utilization())
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventListQuery {
    service: Option<String>,
    severity: Option<String>,
    min_severity: Option<String>,
    max_severity: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    tags: Option<String>,
    page: Option<String>,
    limit: Option<String>,
    sort: Option<String>,
}

fn parse_event_sort(raw: &Option<String>, errors: &mut Vec<FieldError>) -> EventSort {
    match raw.as_deref() {
        None | Some("-timestamp") => EventSort::TimestampDesc,
        Some("timestamp") => EventSort::TimestampAsc,
        Some("-severity") => EventSort::SeverityDesc,
        Some("severity") => EventSort::SeverityAsc,
        Some(other) => {
            errors.push(FieldError::new(
                "sort",
                "expected one of: timestamp, -timestamp, severity, -severity",
                json!(other),
            ));
            EventSort::TimestampDesc
        }
    }
}

/// GET /events: filtered, paginated listing.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<EventListQuery>,
) -> Result<Response, ApiError> {
    let mut errors = Vec::new();
    let filter = EventFilter {
        service: query.service.clone(),
        severity: common::parse_severity("severity", &query.severity, &mut errors),
        min_severity: common::parse_severity("minSeverity", &query.min_severity, &mut errors),
        max_severity: common::parse_severity("maxSeverity", &query.max_severity, &mut errors),
        start: common::parse_date("startDate", &query.start_date, &mut errors),
        end: common::parse_date("endDate", &query.end_date, &mut errors),
        tags: common::parse_tags(&query.tags),
    };
    let pagination = common::parse_pagination(&query.page, &query.limit, &mut errors);
    let sort = parse_event_sort(&query.sort, &mut errors);
    common::fail_if_invalid(errors)?;

    let page = state.events.list_events(&filter, pagination, sort).await?;
    Ok(Json(page).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

/// GET /events/stats: totals plus severity/service distributions.
pub async fn stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Response, ApiError> {
    let mut errors = Vec::new();
    let start = common::parse_date("startDate", &query.start_date, &mut errors);
    let end = common::parse_date("endDate", &query.end_date, &mut errors);
    common::fail_if_invalid(errors)?;

    let summary = state.events.stats(start, end).await?;
    Ok(Json(summary).into_response())
}

/// GET /events/:id
pub async fn get_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = EventId::from_str(&id)
        .map_err(|_| ApiError::validation_one("id", "invalid event id", json!(id)))?;
    let event = state.events.get_event(id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(event).into_response())
}
