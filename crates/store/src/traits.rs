//! Backend-agnostic persistence traits.
//!
//! Implementations must:
//! - keep every update **field-scoped** (concurrent writers touch disjoint
//!   incident fields; whole-document replacement is forbidden)
//! - treat duplicate event ids as per-row conflicts, not batch failures
//! - enforce at-most-once incident assignment on events

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use opspulse_core::{
    Event, EventId, Incident, IncidentId, IncidentStatus, ServiceStats,
};

use crate::error::StoreError;
use crate::query::{
    EventFilter, EventSort, IncidentFilter, IncidentSort, Page, Pagination,
};

/// Outcome of an unordered bulk insert.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertReport {
    pub inserted: u64,
    /// Rows rejected by the unique `event_id` index.
    pub duplicates: Vec<EventId>,
}

impl InsertReport {
    pub fn all_inserted(&self) -> bool {
        self.duplicates.is_empty()
    }
}

/// Aggregate counts for the events stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStatsSummary {
    pub total: u64,
    pub by_severity: BTreeMap<u8, u64>,
    pub by_service: BTreeMap<String, u64>,
}

/// Field-scoped incident mutation. `None` fields are untouched.
///
/// Stores apply patches through the domain helpers: severity only rises,
/// resolution stamps `resolved_at`, first assignment stamps `acknowledged_at`.
#[derive(Debug, Clone, Default)]
pub struct IncidentPatch {
    pub status: Option<IncidentStatus>,
    pub severity_score: Option<u8>,
    pub summary: Option<String>,
    /// Appended (deduplicated), never replaced.
    pub append_event_ids: Option<Vec<EventId>>,
    /// Union with the existing set.
    pub add_affected_services: Option<Vec<String>>,
    pub ai_generated_summary: Option<String>,
    pub root_cause: Option<String>,
    pub resolution: Option<String>,
    pub suggested_actions: Option<Vec<String>>,
    pub assigned_to: Option<String>,
}

impl IncidentPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.severity_score.is_none()
            && self.summary.is_none()
            && self.append_event_ids.is_none()
            && self.add_affected_services.is_none()
            && self.ai_generated_summary.is_none()
            && self.root_cause.is_none()
            && self.resolution.is_none()
            && self.suggested_actions.is_none()
            && self.assigned_to.is_none()
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Unordered bulk insert; duplicates are reported, not fatal.
    async fn insert_many(&self, events: Vec<Event>) -> Result<InsertReport, StoreError>;

    /// Events with `timestamp >= since` and no incident, newest first.
    async fn find_recent_unassigned(&self, since: DateTime<Utc>)
    -> Result<Vec<Event>, StoreError>;

    /// Resolve ids to events, newest first, at most `limit` rows.
    async fn find_by_ids(&self, ids: &[EventId], limit: usize) -> Result<Vec<Event>, StoreError>;

    /// Set `incident_id` on every listed event that does not have one yet.
    /// Returns the number of events actually updated.
    async fn assign_incident(
        &self,
        ids: &[EventId],
        incident_id: IncidentId,
    ) -> Result<u64, StoreError>;

    async fn get_event(&self, id: EventId) -> Result<Option<Event>, StoreError>;

    async fn list_events(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
        sort: EventSort,
    ) -> Result<Page<Event>, StoreError>;

    async fn stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<EventStatsSummary, StoreError>;
}

#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn create(&self, incident: &Incident) -> Result<(), StoreError>;

    async fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StoreError>;

    async fn list_incidents(
        &self,
        filter: &IncidentFilter,
        pagination: Pagination,
        sort: IncidentSort,
    ) -> Result<Page<Incident>, StoreError>;

    /// Open incidents, severity desc then created desc.
    async fn active(&self) -> Result<Vec<Incident>, StoreError>;

    /// Most recent open incident touching `service`, created after the
    /// cutoff. Used by aggregation to extend instead of duplicate.
    async fn find_extension_candidate(
        &self,
        service: &str,
        created_after: DateTime<Utc>,
    ) -> Result<Option<Incident>, StoreError>;

    /// Open incidents without an AI summary, created after the cutoff,
    /// severity desc then created desc, at most `limit`.
    async fn find_summary_needed(
        &self,
        created_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Incident>, StoreError>;

    /// Apply a field-scoped patch; returns the updated incident, or `None`
    /// if the id is unknown.
    async fn update(
        &self,
        id: IncidentId,
        patch: &IncidentPatch,
    ) -> Result<Option<Incident>, StoreError>;
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    /// `count += delta` for `(service, window_key)`, inserting on first
    /// touch and refreshing the row timestamp.
    async fn upsert_count(
        &self,
        service: &str,
        window_key: &str,
        delta: u64,
    ) -> Result<(), StoreError>;

    /// Latest windows for a service, newest first, at most `limit` rows.
    async fn find_recent(&self, service: &str, limit: usize)
    -> Result<Vec<ServiceStats>, StoreError>;

    /// Drop rows last touched before the cutoff; returns rows removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn insert_many(&self, events: Vec<Event>) -> Result<InsertReport, StoreError> {
        (**self).insert_many(events).await
    }

    async fn find_recent_unassigned(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        (**self).find_recent_unassigned(since).await
    }

    async fn find_by_ids(&self, ids: &[EventId], limit: usize) -> Result<Vec<Event>, StoreError> {
        (**self).find_by_ids(ids, limit).await
    }

    async fn assign_incident(
        &self,
        ids: &[EventId],
        incident_id: IncidentId,
    ) -> Result<u64, StoreError> {
        (**self).assign_incident(ids, incident_id).await
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        (**self).get_event(id).await
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
        sort: EventSort,
    ) -> Result<Page<Event>, StoreError> {
        (**self).list_events(filter, pagination, sort).await
    }

    async fn stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<EventStatsSummary, StoreError> {
        (**self).stats(start, end).await
    }
}

#[async_trait]
impl<S> IncidentStore for Arc<S>
where
    S: IncidentStore + ?Sized,
{
    async fn create(&self, incident: &Incident) -> Result<(), StoreError> {
        (**self).create(incident).await
    }

    async fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
        (**self).get_incident(id).await
    }

    async fn list_incidents(
        &self,
        filter: &IncidentFilter,
        pagination: Pagination,
        sort: IncidentSort,
    ) -> Result<Page<Incident>, StoreError> {
        (**self).list_incidents(filter, pagination, sort).await
    }

    async fn active(&self) -> Result<Vec<Incident>, StoreError> {
        (**self).active().await
    }

    async fn find_extension_candidate(
        &self,
        service: &str,
        created_after: DateTime<Utc>,
    ) -> Result<Option<Incident>, StoreError> {
        (**self).find_extension_candidate(service, created_after).await
    }

    async fn find_summary_needed(
        &self,
        created_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Incident>, StoreError> {
        (**self).find_summary_needed(created_after, limit).await
    }

    async fn update(
        &self,
        id: IncidentId,
        patch: &IncidentPatch,
    ) -> Result<Option<Incident>, StoreError> {
        (**self).update(id, patch).await
    }
}

#[async_trait]
impl<S> StatsStore for Arc<S>
where
    S: StatsStore + ?Sized,
{
    async fn upsert_count(
        &self,
        service: &str,
        window_key: &str,
        delta: u64,
    ) -> Result<(), StoreError> {
        (**self).upsert_count(service, window_key, delta).await
    }

    async fn find_recent(
        &self,
        service: &str,
        limit: usize,
    ) -> Result<Vec<ServiceStats>, StoreError> {
        (**self).find_recent(service, limit).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        (**self).delete_older_than(cutoff).await
    }
}
