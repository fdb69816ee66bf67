//! In-memory backend. Intended for tests/dev; clone-on-read, sort-on-query.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use opspulse_core::{Event, EventId, Incident, IncidentId, IncidentStatus, ServiceStats};

use crate::error::StoreError;
use crate::query::{EventFilter, EventSort, IncidentFilter, IncidentSort, Page, Pagination};
use crate::traits::{
    EventStatsSummary, EventStore, IncidentPatch, IncidentStore, InsertReport, StatsStore,
};

/// One struct backing all three store contracts.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    events: RwLock<HashMap<EventId, Event>>,
    incidents: RwLock<HashMap<IncidentId, Incident>>,
    /// Keyed by `(service, window_key)`.
    stats: RwLock<HashMap<(String, String), ServiceStats>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::unavailable("lock poisoned")
}

fn event_matches(event: &Event, filter: &EventFilter) -> bool {
    if let Some(ref service) = filter.service {
        if event.service != *service {
            return false;
        }
    }
    let severity = event.severity.get();
    if filter.severity.is_some_and(|s| severity != s) {
        return false;
    }
    if filter.min_severity.is_some_and(|s| severity < s) {
        return false;
    }
    if filter.max_severity.is_some_and(|s| severity > s) {
        return false;
    }
    if filter.start.is_some_and(|t| event.timestamp < t) {
        return false;
    }
    if filter.end.is_some_and(|t| event.timestamp > t) {
        return false;
    }
    filter.tags.iter().all(|tag| event.tags.contains(tag))
}

fn incident_matches(incident: &Incident, filter: &IncidentFilter) -> bool {
    if filter.status.is_some_and(|s| incident.status != s) {
        return false;
    }
    if filter
        .min_severity
        .is_some_and(|s| incident.severity_score < s)
    {
        return false;
    }
    if let Some(ref service) = filter.service {
        if !incident.affected_services.contains(service) {
            return false;
        }
    }
    if filter.start.is_some_and(|t| incident.created_at < t) {
        return false;
    }
    if filter.end.is_some_and(|t| incident.created_at > t) {
        return false;
    }
    true
}

/// Numeric window position from a `w_<ms>` key; falls back to the row
/// timestamp when the key is malformed.
fn window_position(row: &ServiceStats) -> i64 {
    row.window_key
        .strip_prefix("w_")
        .and_then(|ms| ms.parse::<i64>().ok())
        .unwrap_or_else(|| row.timestamp.timestamp_millis())
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_many(&self, events: Vec<Event>) -> Result<InsertReport, StoreError> {
        let mut map = self.events.write().map_err(|_| poisoned())?;
        let mut report = InsertReport::default();
        for event in events {
            if map.contains_key(&event.event_id) {
                report.duplicates.push(event.event_id);
                continue;
            }
            map.insert(event.event_id, event);
            report.inserted += 1;
        }
        Ok(report)
    }

    async fn find_recent_unassigned(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Event>, StoreError> {
        let map = self.events.read().map_err(|_| poisoned())?;
        let mut out: Vec<Event> = map
            .values()
            .filter(|e| e.incident_id.is_none() && e.timestamp >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }

    async fn find_by_ids(&self, ids: &[EventId], limit: usize) -> Result<Vec<Event>, StoreError> {
        let map = self.events.read().map_err(|_| poisoned())?;
        let mut out: Vec<Event> = ids.iter().filter_map(|id| map.get(id).cloned()).collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out.truncate(limit);
        Ok(out)
    }

    async fn assign_incident(
        &self,
        ids: &[EventId],
        incident_id: IncidentId,
    ) -> Result<u64, StoreError> {
        let mut map = self.events.write().map_err(|_| poisoned())?;
        let mut updated = 0;
        for id in ids {
            if let Some(event) = map.get_mut(id) {
                if event.incident_id.is_none() {
                    event.incident_id = Some(incident_id);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn get_event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        let map = self.events.read().map_err(|_| poisoned())?;
        Ok(map.get(&id).cloned())
    }

    async fn list_events(
        &self,
        filter: &EventFilter,
        pagination: Pagination,
        sort: EventSort,
    ) -> Result<Page<Event>, StoreError> {
        let map = self.events.read().map_err(|_| poisoned())?;
        let mut matched: Vec<Event> = map
            .values()
            .filter(|e| event_matches(e, filter))
            .cloned()
            .collect();

        matched.sort_by(|a, b| match sort {
            EventSort::TimestampDesc => b.timestamp.cmp(&a.timestamp),
            EventSort::TimestampAsc => a.timestamp.cmp(&b.timestamp),
            EventSort::SeverityDesc => b
                .severity
                .cmp(&a.severity)
                .then_with(|| b.timestamp.cmp(&a.timestamp)),
            EventSort::SeverityAsc => a
                .severity
                .cmp(&b.severity)
                .then_with(|| b.timestamp.cmp(&a.timestamp)),
        });

        let total = matched.len() as u64;
        let items: Vec<Event> = matched
            .into_iter()
            .skip(pagination.offset())
            .take(pagination.limit as usize)
            .collect();
        Ok(Page::new(items, pagination, total))
    }

    async fn stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<EventStatsSummary, StoreError> {
        let map = self.events.read().map_err(|_| poisoned())?;
        let mut summary = EventStatsSummary::default();
        for event in map.values() {
            if start.is_some_and(|t| event.timestamp < t) {
                continue;
            }
            if end.is_some_and(|t| event.timestamp > t) {
                continue;
            }
            summary.total += 1;
            *summary.by_severity.entry(event.severity.get()).or_insert(0) += 1;
            *summary.by_service.entry(event.service.clone()).or_insert(0) += 1;
        }
        Ok(summary)
    }
}

#[async_trait]
impl IncidentStore for InMemoryStore {
    async fn create(&self, incident: &Incident) -> Result<(), StoreError> {
        let mut map = self.incidents.write().map_err(|_| poisoned())?;
        if map.contains_key(&incident.incident_id) {
            return Err(StoreError::conflict(format!(
                "incident {} already exists",
                incident.incident_id
            )));
        }
        map.insert(incident.incident_id, incident.clone());
        Ok(())
    }

    async fn get_incident(&self, id: IncidentId) -> Result<Option<Incident>, StoreError> {
        let map = self.incidents.read().map_err(|_| poisoned())?;
        Ok(map.get(&id).cloned())
    }

    async fn list_incidents(
        &self,
        filter: &IncidentFilter,
        pagination: Pagination,
        sort: IncidentSort,
    ) -> Result<Page<Incident>, StoreError> {
        let map = self.incidents.read().map_err(|_| poisoned())?;
        let mut matched: Vec<Incident> = map
            .values()
            .filter(|i| incident_matches(i, filter))
            .cloned()
            .collect();

        matched.sort_by(|a, b| match sort {
            IncidentSort::CreatedDesc => b.created_at.cmp(&a.created_at),
            IncidentSort::CreatedAsc => a.created_at.cmp(&b.created_at),
            IncidentSort::SeverityDesc => b
                .severity_score
                .cmp(&a.severity_score)
                .then_with(|| b.created_at.cmp(&a.created_at)),
            IncidentSort::UpdatedDesc => b.updated_at.cmp(&a.updated_at),
        });

        let total = matched.len() as u64;
        let items: Vec<Incident> = matched
            .into_iter()
            .skip(pagination.offset())
            .take(pagination.limit as usize)
            .collect();
        Ok(Page::new(items, pagination, total))
    }

    async fn active(&self) -> Result<Vec<Incident>, StoreError> {
        let map = self.incidents.read().map_err(|_| poisoned())?;
        let mut out: Vec<Incident> = map
            .values()
            .filter(|i| i.status.is_open())
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.severity_score
                .cmp(&a.severity_score)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(out)
    }

    async fn find_extension_candidate(
        &self,
        service: &str,
        created_after: DateTime<Utc>,
    ) -> Result<Option<Incident>, StoreError> {
        let map = self.incidents.read().map_err(|_| poisoned())?;
        Ok(map
            .values()
            .filter(|i| {
                i.status.is_open()
                    && i.created_at >= created_after
                    && i.affected_services.contains(service)
            })
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn find_summary_needed(
        &self,
        created_after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Incident>, StoreError> {
        let map = self.incidents.read().map_err(|_| poisoned())?;
        let mut out: Vec<Incident> = map
            .values()
            .filter(|i| {
                i.status.is_open()
                    && i.created_at >= created_after
                    && i.ai_generated_summary.is_empty()
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.severity_score
                .cmp(&a.severity_score)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        out.truncate(limit);
        Ok(out)
    }

    async fn update(
        &self,
        id: IncidentId,
        patch: &IncidentPatch,
    ) -> Result<Option<Incident>, StoreError> {
        let mut map = self.incidents.write().map_err(|_| poisoned())?;
        let Some(incident) = map.get_mut(&id) else {
            return Ok(None);
        };

        if let Some(ids) = &patch.append_event_ids {
            incident.add_events(ids);
        }
        if let Some(score) = patch.severity_score {
            incident.raise_severity(score);
        }
        if let Some(summary) = &patch.summary {
            incident.summary = summary.clone();
        }
        if let Some(services) = &patch.add_affected_services {
            incident
                .affected_services
                .extend(services.iter().cloned());
        }
        if let Some(ai) = &patch.ai_generated_summary {
            incident.ai_generated_summary = ai.clone();
        }
        if let Some(root_cause) = &patch.root_cause {
            incident.root_cause = root_cause.clone();
        }
        if let Some(resolution) = &patch.resolution {
            incident.resolution = resolution.clone();
        }
        if let Some(actions) = &patch.suggested_actions {
            incident.suggested_actions = actions.clone();
        }
        if let Some(operator) = &patch.assigned_to {
            incident.assign(operator.clone());
        }
        if let Some(status) = patch.status {
            match status {
                IncidentStatus::Resolved => incident.resolve(),
                // Resolved is terminal; reopening is not a thing.
                other if incident.status.is_open() => {
                    incident.status = other;
                }
                _ => {}
            }
        }
        incident.updated_at = Utc::now();

        Ok(Some(incident.clone()))
    }
}

#[async_trait]
impl StatsStore for InMemoryStore {
    async fn upsert_count(
        &self,
        service: &str,
        window_key: &str,
        delta: u64,
    ) -> Result<(), StoreError> {
        let mut map = self.stats.write().map_err(|_| poisoned())?;
        let row = map
            .entry((service.to_string(), window_key.to_string()))
            .or_insert_with(|| ServiceStats {
                service: service.to_string(),
                window_key: window_key.to_string(),
                count: 0,
                timestamp: Utc::now(),
            });
        row.count += delta;
        row.timestamp = Utc::now();
        Ok(())
    }

    async fn find_recent(
        &self,
        service: &str,
        limit: usize,
    ) -> Result<Vec<ServiceStats>, StoreError> {
        let map = self.stats.read().map_err(|_| poisoned())?;
        let mut out: Vec<ServiceStats> = map
            .values()
            .filter(|row| row.service == service)
            .cloned()
            .collect();
        out.sort_by_key(|row| std::cmp::Reverse(window_position(row)));
        out.truncate(limit);
        Ok(out)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut map = self.stats.write().map_err(|_| poisoned())?;
        let before = map.len();
        map.retain(|_, row| row.timestamp >= cutoff);
        Ok((before - map.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::collections::BTreeSet;

    use opspulse_core::Severity;

    fn event(service: &str, severity: i64) -> Event {
        Event::new(service, Severity::clamped(severity), json!({}))
    }

    fn incident(services: &[&str], severity: u8) -> Incident {
        Incident::new(
            vec![EventId::new()],
            severity,
            services.iter().map(|s| s.to_string()).collect(),
            format!("1 severity_{severity} events from {}", services.join(",")),
        )
    }

    #[tokio::test]
    async fn insert_many_reports_duplicates_per_row() {
        let store = InMemoryStore::new();
        let a = event("orders", 3);
        let b = event("orders", 2);
        let report = store.insert_many(vec![a.clone(), b.clone()]).await.unwrap();
        assert_eq!(report.inserted, 2);

        let report = store
            .insert_many(vec![a.clone(), event("orders", 1)])
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, vec![a.event_id]);
    }

    #[tokio::test]
    async fn assignment_is_at_most_once() {
        let store = InMemoryStore::new();
        let e = event("orders", 3);
        store.insert_many(vec![e.clone()]).await.unwrap();

        let first = IncidentId::new();
        let second = IncidentId::new();
        assert_eq!(store.assign_incident(&[e.event_id], first).await.unwrap(), 1);
        assert_eq!(
            store.assign_incident(&[e.event_id], second).await.unwrap(),
            0
        );
        let stored = store.get_event(e.event_id).await.unwrap().unwrap();
        assert_eq!(stored.incident_id, Some(first));
    }

    #[tokio::test]
    async fn unassigned_query_is_newest_first_and_windowed() {
        let store = InMemoryStore::new();
        let mut old = event("orders", 3);
        old.timestamp = Utc::now() - Duration::minutes(10);
        let fresh = event("orders", 3);
        let mut assigned = event("orders", 3);
        assigned.incident_id = Some(IncidentId::new());
        store
            .insert_many(vec![old, fresh.clone(), assigned])
            .await
            .unwrap();

        let found = store
            .find_recent_unassigned(Utc::now() - Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event_id, fresh.event_id);
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let store = InMemoryStore::new();
        let mut tagged = event("orders", 4);
        tagged.tags = BTreeSet::from(["db".to_string(), "prod".to_string()]);
        store
            .insert_many(vec![tagged, event("orders", 2), event("billing", 5)])
            .await
            .unwrap();

        let filter = EventFilter {
            service: Some("orders".to_string()),
            min_severity: Some(3),
            ..Default::default()
        };
        let page = store
            .list_events(&filter, Pagination::default(), EventSort::TimestampDesc)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].severity.get(), 4);

        let all = store
            .list_events(
                &EventFilter::default(),
                Pagination { page: 2, limit: 2 },
                EventSort::SeverityDesc,
            )
            .await
            .unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.items.len(), 1);
        assert_eq!(all.total_pages, 2);

        let by_tag = store
            .list_events(
                &EventFilter {
                    tags: vec!["db".to_string()],
                    ..Default::default()
                },
                Pagination::default(),
                EventSort::TimestampDesc,
            )
            .await
            .unwrap();
        assert_eq!(by_tag.total, 1);
    }

    #[tokio::test]
    async fn stats_distributions() {
        let store = InMemoryStore::new();
        store
            .insert_many(vec![event("orders", 3), event("orders", 3), event("billing", 5)])
            .await
            .unwrap();
        let summary = store.stats(None, None).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_severity[&3], 2);
        assert_eq!(summary.by_service["orders"], 2);
    }

    #[tokio::test]
    async fn extension_candidate_prefers_most_recent_open_incident() {
        let store = InMemoryStore::new();
        let mut resolved = incident(&["orders"], 4);
        resolved.resolve();
        let mut older = incident(&["orders"], 3);
        older.created_at = Utc::now() - Duration::minutes(4);
        let newer = incident(&["orders"], 2);
        store.create(&resolved).await.unwrap();
        store.create(&older).await.unwrap();
        store.create(&newer).await.unwrap();

        let found = store
            .find_extension_candidate("orders", Utc::now() - Duration::minutes(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.incident_id, newer.incident_id);

        assert!(
            store
                .find_extension_candidate("billing", Utc::now() - Duration::minutes(10))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn summary_needed_orders_by_severity_then_recency() {
        let store = InMemoryStore::new();
        let low = incident(&["a"], 2);
        let high = incident(&["b"], 5);
        let mut done = incident(&["c"], 4);
        done.ai_generated_summary = "already summarized".to_string();
        store.create(&low).await.unwrap();
        store.create(&high).await.unwrap();
        store.create(&done).await.unwrap();

        let found = store
            .find_summary_needed(Utc::now() - Duration::hours(24), 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].incident_id, high.incident_id);
        assert_eq!(found[1].incident_id, low.incident_id);
    }

    #[tokio::test]
    async fn update_applies_field_scoped_patch() {
        let store = InMemoryStore::new();
        let i = incident(&["orders"], 3);
        store.create(&i).await.unwrap();

        let fresh = EventId::new();
        let updated = store
            .update(
                i.incident_id,
                &IncidentPatch {
                    severity_score: Some(2),
                    append_event_ids: Some(vec![fresh]),
                    ai_generated_summary: Some("model text".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        // Lowering is ignored; appends and summary land.
        assert_eq!(updated.severity_score, 3);
        assert!(updated.event_ids.contains(&fresh));
        assert_eq!(updated.ai_generated_summary, "model text");
        assert_eq!(updated.summary, i.summary);

        let resolved = store
            .update(
                i.incident_id,
                &IncidentPatch {
                    status: Some(IncidentStatus::Resolved),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(resolved.resolved_at.is_some());

        assert!(
            store
                .update(IncidentId::new(), &IncidentPatch::default())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn stats_store_upserts_and_expires() {
        let store = InMemoryStore::new();
        store.upsert_count("orders", "w_1000", 3).await.unwrap();
        store.upsert_count("orders", "w_1000", 2).await.unwrap();
        store.upsert_count("orders", "w_2000", 7).await.unwrap();
        store.upsert_count("billing", "w_2000", 1).await.unwrap();

        let recent = store.find_recent("orders", 12).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].window_key, "w_2000");
        assert_eq!(recent[0].count, 7);
        assert_eq!(recent[1].count, 5);

        let limited = store.find_recent("orders", 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        let removed = store
            .delete_older_than(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 4);
    }
}
