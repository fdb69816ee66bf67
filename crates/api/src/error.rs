//! API error taxonomy and HTTP mapping.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use opspulse_core::DomainError;
use opspulse_store::StoreError;

/// One rejected input field.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    #[serde(skip_serializing_if = "JsonValue::is_null")]
    pub value: JsonValue,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, value: JsonValue) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            value,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("server overloaded")]
    Overloaded { retry_after_secs: u64 },

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable")]
    StoreUnavailable(String),

    #[error("ai provider unavailable")]
    ExternalUnavailable { retry_after_secs: Option<u64> },

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn validation_one(
        field: impl Into<String>,
        message: impl Into<String>,
        value: JsonValue,
    ) -> Self {
        Self::Validation(vec![FieldError::new(field, message, value)])
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Overloaded { .. } => "overloaded",
            ApiError::NotFound => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::StoreUnavailable(_) => "store_unavailable",
            ApiError::ExternalUnavailable { .. } => "ai_unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Overloaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ExternalUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            ApiError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            ApiError::Overloaded { retry_after_secs } => Some(*retry_after_secs),
            ApiError::StoreUnavailable(_) => Some(5),
            ApiError::ExternalUnavailable { retry_after_secs } => {
                Some(retry_after_secs.unwrap_or(30))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Internal(detail) => {
                tracing::error!(%detail, "internal error on request path");
            }
            ApiError::StoreUnavailable(detail) => {
                tracing::warn!(%detail, "store unavailable on request path");
            }
            // Backpressure outcomes are normal operation, not error-level.
            _ => {}
        }

        let status = self.status();
        let retry_after = self.retry_after();
        let body = match &self {
            ApiError::Validation(details) => serde_json::json!({
                "error": self.code(),
                "message": self.to_string(),
                "details": details,
            }),
            _ => serde_json::json!({
                "error": self.code(),
                "message": self.to_string(),
            }),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Unavailable(msg) => ApiError::StoreUnavailable(msg),
            StoreError::Corrupt(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::NotFound => ApiError::NotFound,
            DomainError::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::validation_one("request", other.to_string(), JsonValue::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ApiError::Validation(vec![]).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::RateLimited { retry_after_secs: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Overloaded { retry_after_secs: 5 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Conflict("dup".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Internal("bug".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn retryable_errors_carry_retry_after() {
        let response = ApiError::Overloaded { retry_after_secs: 5 }.into_response();
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            HeaderValue::from_static("5")
        );

        let response = ApiError::NotFound.into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
