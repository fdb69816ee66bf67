//! Shared query-string parsing helpers.
//!
//! Query fields arrive as raw strings so bad values surface as field-level
//! validation errors instead of the framework's generic rejection.

use chrono::{DateTime, Utc};
use serde_json::json;

use opspulse_store::Pagination;

use crate::error::{ApiError, FieldError};

/// Hard cap on page size, regardless of what the client asks for.
pub const MAX_PAGE_LIMIT: u32 = 200;

pub fn parse_date(
    field: &str,
    raw: &Option<String>,
    errors: &mut Vec<FieldError>,
) -> Option<DateTime<Utc>> {
    let raw = raw.as_deref()?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => Some(parsed.with_timezone(&Utc)),
        Err(_) => {
            errors.push(FieldError::new(
                field,
                "expected an RFC 3339 timestamp",
                json!(raw),
            ));
            None
        }
    }
}

pub fn parse_severity(
    field: &str,
    raw: &Option<String>,
    errors: &mut Vec<FieldError>,
) -> Option<u8> {
    let raw = raw.as_deref()?;
    match raw.parse::<u8>() {
        Ok(value) if (1..=5).contains(&value) => Some(value),
        _ => {
            errors.push(FieldError::new(
                field,
                "expected an integer between 1 and 5",
                json!(raw),
            ));
            None
        }
    }
}

pub fn parse_pagination(
    page: &Option<String>,
    limit: &Option<String>,
    errors: &mut Vec<FieldError>,
) -> Pagination {
    let mut pagination = Pagination::default();
    if let Some(raw) = page.as_deref() {
        match raw.parse::<u32>() {
            Ok(value) if value >= 1 => pagination.page = value,
            _ => errors.push(FieldError::new(
                "page",
                "expected a positive integer",
                json!(raw),
            )),
        }
    }
    if let Some(raw) = limit.as_deref() {
        match raw.parse::<u32>() {
            Ok(value) if value >= 1 => pagination.limit = value.min(MAX_PAGE_LIMIT),
            _ => errors.push(FieldError::new(
                "limit",
                "expected a positive integer",
                json!(raw),
            )),
        }
    }
    pagination
}

/// Comma-separated tags, trimmed, empties dropped.
pub fn parse_tags(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|csv| {
            csv.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn fail_if_invalid(errors: Vec<FieldError>) -> Result<(), ApiError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Validation(errors))
    }
}
