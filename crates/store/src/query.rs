//! Filter, sort, and pagination types shared by every backend.

use chrono::{DateTime, Utc};
use serde::Serialize;

use opspulse_core::IncidentStatus;

/// Page request. `limit` is capped by the surface layer (max 200).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Pagination {
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, limit: 50 }
    }
}

impl Pagination {
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }
}

/// One page of results plus totals.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, pagination: Pagination, total: u64) -> Self {
        let limit = pagination.limit.max(1) as u64;
        Self {
            items,
            page: pagination.page,
            limit: pagination.limit,
            total,
            total_pages: total.div_ceil(limit),
        }
    }
}

/// Event listing filter; all fields conjunctive, `service` is exact match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub service: Option<String>,
    pub severity: Option<u8>,
    pub min_severity: Option<u8>,
    pub max_severity: Option<u8>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Event must carry every listed tag.
    pub tags: Vec<String>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum EventSort {
    #[default]
    TimestampDesc,
    TimestampAsc,
    SeverityDesc,
    SeverityAsc,
}

/// Incident listing filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncidentFilter {
    pub status: Option<IncidentStatus>,
    pub min_severity: Option<u8>,
    /// Exact match against `affected_services`.
    pub service: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum IncidentSort {
    #[default]
    CreatedDesc,
    CreatedAsc,
    SeverityDesc,
    UpdatedDesc,
}
