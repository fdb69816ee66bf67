//! Periodic clusterer: scans recent unassigned events, updates the spike
//! detector, scores clusters, and creates or extends incidents.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use opspulse_broadcast::{BroadcastHub, IncidentAction};
use opspulse_core::{Event, EventId, Incident};
use opspulse_detect::{
    Classification, ScoringConfig, SpikeContext, SpikeDetector, SpikeResult, score_incident,
};
use opspulse_store::{EventStore, IncidentPatch, IncidentStore, StatsStore, StoreError};

use crate::handle::WorkerHandle;

#[derive(Debug, Clone)]
pub struct AggregationConfig {
    pub interval: Duration,
    /// Look-back for "recent" events.
    pub window: Duration,
    /// Every Nth run triggers spike-detector cleanup.
    pub cleanup_every: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            window: Duration::from_secs(300),
            cleanup_every: 10,
        }
    }
}

/// What one run did; returned for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub scanned: usize,
    pub clusters: usize,
    pub created: usize,
    pub extended: usize,
    pub failed_clusters: usize,
}

/// Singleton worker; a run in progress inhibits the next tick because ticks
/// and runs share one task.
pub struct AggregationWorker {
    config: AggregationConfig,
    events: Arc<dyn EventStore>,
    incidents: Arc<dyn IncidentStore>,
    detector: SpikeDetector<Arc<dyn StatsStore>>,
    scoring: ScoringConfig,
    hub: Arc<BroadcastHub>,
    runs: u64,
}

impl AggregationWorker {
    pub fn new(
        config: AggregationConfig,
        events: Arc<dyn EventStore>,
        incidents: Arc<dyn IncidentStore>,
        detector: SpikeDetector<Arc<dyn StatsStore>>,
        scoring: ScoringConfig,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        Self {
            config,
            events,
            incidents,
            detector,
            scoring,
            hub,
            runs: 0,
        }
    }

    /// Execute one aggregation pass.
    pub async fn run_once(&mut self) -> Result<RunReport, StoreError> {
        self.runs += 1;
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let recent = self.events.find_recent_unassigned(now - window).await?;
        let mut report = RunReport {
            scanned: recent.len(),
            ..Default::default()
        };
        if recent.is_empty() {
            self.maintenance().await;
            return Ok(report);
        }

        // Per-service tallies feed the spike detector before evaluation.
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for event in &recent {
            *counts.entry(event.service.clone()).or_insert(0) += 1;
        }
        self.detector.record_counts(&counts, now).await;
        let spike_data = self.detector.check_spikes(&counts).await;
        let spike_contexts: BTreeMap<String, SpikeContext> = spike_data
            .iter()
            .map(|(service, result)| (service.clone(), SpikeContext::from(result)))
            .collect();

        // Bucket by (service, error type); BTreeMap keeps runs deterministic.
        let mut clusters: BTreeMap<(String, String), Vec<Event>> = BTreeMap::new();
        for event in recent {
            let key = (event.service.clone(), event.error_type());
            clusters.entry(key).or_default().push(event);
        }
        report.clusters = clusters.len();

        for ((service, error_type), mut cluster) in clusters {
            cluster.sort_by_key(|e| e.timestamp);
            match self
                .materialize_cluster(&service, &error_type, cluster, &spike_contexts, &spike_data)
                .await
            {
                Ok(true) => report.extended += 1,
                Ok(false) => report.created += 1,
                Err(err) => {
                    report.failed_clusters += 1;
                    tracing::warn!(%service, %error_type, %err, "cluster aggregation failed, skipping");
                }
            }
        }

        self.maintenance().await;
        Ok(report)
    }

    /// Returns `Ok(true)` if an existing incident was extended, `Ok(false)`
    /// if a new one was created.
    async fn materialize_cluster(
        &self,
        service: &str,
        error_type: &str,
        cluster: Vec<Event>,
        spike_contexts: &BTreeMap<String, SpikeContext>,
        spike_data: &BTreeMap<String, SpikeResult>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let score = score_incident(&cluster, spike_contexts, &self.scoring);
        let event_ids: Vec<EventId> = cluster.iter().map(|e| e.event_id).collect();
        let spike = spike_data.get(service).filter(|s| s.is_spike);

        let candidate = self
            .incidents
            .find_extension_candidate(service, now - window * 2)
            .await?;

        if let Some(existing) = candidate {
            let known: BTreeSet<EventId> = existing.event_ids.iter().copied().collect();
            let fresh: Vec<EventId> = event_ids
                .iter()
                .copied()
                .filter(|id| !known.contains(id))
                .collect();
            let total_events = existing.event_ids.len() + fresh.len();
            let duration_minutes =
                (now - existing.created_at).num_minutes().max(0);

            let patch = IncidentPatch {
                append_event_ids: Some(fresh),
                severity_score: Some(score.level),
                add_affected_services: Some(vec![service.to_string()]),
                summary: Some(render_summary(
                    total_events,
                    error_type,
                    service,
                    score.classification,
                    spike,
                    duration_minutes,
                )),
                ..Default::default()
            };
            let updated = self
                .incidents
                .update(existing.incident_id, &patch)
                .await?
                .ok_or_else(|| {
                    StoreError::unavailable("extension candidate vanished mid-run")
                })?;
            self.events
                .assign_incident(&event_ids, existing.incident_id)
                .await?;
            self.hub.publish_incident(&updated, IncidentAction::Updated);
            Ok(true)
        } else {
            let summary = render_summary(
                cluster.len(),
                error_type,
                service,
                score.classification,
                spike,
                0,
            );
            let incident = Incident::new(
                event_ids.clone(),
                score.level,
                BTreeSet::from([service.to_string()]),
                summary,
            );
            self.incidents.create(&incident).await?;
            self.events
                .assign_incident(&event_ids, incident.incident_id)
                .await?;
            self.hub.publish_incident(&incident, IncidentAction::Created);
            Ok(false)
        }
    }

    async fn maintenance(&self) {
        if self.runs % self.config.cleanup_every == 0 {
            match self.detector.cleanup().await {
                Ok(removed) => {
                    tracing::debug!(removed, "spike detector cleanup");
                }
                Err(err) => tracing::warn!(%err, "spike detector cleanup failed"),
            }
        }
    }

    /// Spawn the periodic loop. One task owns the worker, so runs never
    /// overlap.
    pub fn spawn(mut self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.interval;
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(report) if report.scanned > 0 => {
                                tracing::info!(
                                    scanned = report.scanned,
                                    clusters = report.clusters,
                                    created = report.created,
                                    extended = report.extended,
                                    failed = report.failed_clusters,
                                    "aggregation run complete"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => tracing::error!(%err, "aggregation run failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        WorkerHandle::new(shutdown_tx, join)
    }
}

/// Deterministic incident summary line.
fn render_summary(
    count: usize,
    error_type: &str,
    service: &str,
    classification: Classification,
    spike: Option<&SpikeResult>,
    duration_minutes: i64,
) -> String {
    let mut out = format!(
        "{count} {error_type} events from {service}. Severity: {}",
        classification.as_str().to_uppercase()
    );
    if let Some(spike) = spike {
        out.push_str(&format!(
            ". Spike detected: {:.1}σ above normal",
            spike.deviations
        ));
    }
    if duration_minutes >= 1 {
        out.push_str(&format!(". Duration: {duration_minutes} minutes"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use opspulse_broadcast::HubConfig;
    use opspulse_core::{IncidentStatus, Severity};
    use opspulse_detect::{SpikeConfig, SpikeLevel};
    use opspulse_store::InMemoryStore;

    fn worker(store: &Arc<InMemoryStore>) -> AggregationWorker {
        let events: Arc<dyn EventStore> = store.clone();
        let incidents: Arc<dyn IncidentStore> = store.clone();
        let stats: Arc<dyn StatsStore> = store.clone();
        AggregationWorker::new(
            AggregationConfig::default(),
            events,
            incidents,
            SpikeDetector::new(SpikeConfig::default(), stats),
            ScoringConfig::default(),
            Arc::new(BroadcastHub::new(HubConfig::default())),
        )
    }

    fn deadlock_event(service: &str, severity: i64) -> Event {
        Event::new(
            service,
            Severity::clamped(severity),
            json!({"errorType": "DeadlockDetected"}),
        )
    }

    #[tokio::test]
    async fn creates_incident_and_backlinks_events() {
        let store = Arc::new(InMemoryStore::new());
        let mut worker = worker(&store);

        let a = deadlock_event("order-service", 3);
        let b = deadlock_event("order-service", 4);
        store.insert_many(vec![a.clone(), b.clone()]).await.unwrap();

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.clusters, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.failed_clusters, 0);

        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 1);
        let incident = &active[0];
        assert_eq!(incident.event_ids.len(), 2);
        assert_eq!(incident.status, IncidentStatus::Active);
        assert!(incident.summary.contains("DeadlockDetected events from order-service"));

        let stored = store.get_event(a.event_id).await.unwrap().unwrap();
        assert_eq!(stored.incident_id, Some(incident.incident_id));
    }

    #[tokio::test]
    async fn second_run_extends_instead_of_duplicating() {
        let store = Arc::new(InMemoryStore::new());
        let mut worker = worker(&store);

        store
            .insert_many(vec![
                deadlock_event("order-service", 3),
                deadlock_event("order-service", 3),
            ])
            .await
            .unwrap();
        worker.run_once().await.unwrap();
        let first = store.active().await.unwrap();
        let incident_id = first[0].incident_id;
        let first_severity = first[0].severity_score;

        store
            .insert_many(vec![
                deadlock_event("order-service", 3),
                deadlock_event("order-service", 3),
            ])
            .await
            .unwrap();
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.extended, 1);
        assert_eq!(report.created, 0);

        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].incident_id, incident_id);
        assert_eq!(active[0].event_ids.len(), 4);
        assert_eq!(
            active[0].affected_services,
            BTreeSet::from(["order-service".to_string()])
        );
        assert!(active[0].severity_score >= first_severity);
    }

    #[tokio::test]
    async fn clusters_split_by_service_and_error_type() {
        let store = Arc::new(InMemoryStore::new());
        let mut worker = worker(&store);

        store
            .insert_many(vec![
                deadlock_event("order-service", 3),
                Event::new("order-service", Severity::clamped(3), json!({"errorType": "Timeout"})),
                deadlock_event("billing", 3),
            ])
            .await
            .unwrap();

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.clusters, 3);
        // Same-service clusters coalesce into one incident via extension.
        assert_eq!(report.created + report.extended, 3);
        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn assigned_events_are_not_rescanned() {
        let store = Arc::new(InMemoryStore::new());
        let mut worker = worker(&store);

        store
            .insert_many(vec![deadlock_event("order-service", 3)])
            .await
            .unwrap();
        worker.run_once().await.unwrap();

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(report.created, 0);
    }

    #[tokio::test]
    async fn resolved_incidents_are_not_extended() {
        let store = Arc::new(InMemoryStore::new());
        let mut worker = worker(&store);

        store
            .insert_many(vec![deadlock_event("order-service", 3)])
            .await
            .unwrap();
        worker.run_once().await.unwrap();

        let incident_id = store.active().await.unwrap()[0].incident_id;
        store
            .update(
                incident_id,
                &IncidentPatch {
                    status: Some(IncidentStatus::Resolved),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store
            .insert_many(vec![deadlock_event("order-service", 3)])
            .await
            .unwrap();
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.extended, 0);
    }

    #[test]
    fn summary_renders_all_optional_segments() {
        let spike = SpikeResult {
            is_spike: true,
            level: SpikeLevel::Elevated,
            deviations: 2.5,
            mean: 11.0,
            std_dev: 2.0,
            current: 16,
            has_enough_data: true,
        };
        let full = render_summary(
            4,
            "DeadlockDetected",
            "order-service",
            Classification::High,
            Some(&spike),
            7,
        );
        assert_eq!(
            full,
            "4 DeadlockDetected events from order-service. Severity: HIGH. \
             Spike detected: 2.5σ above normal. Duration: 7 minutes"
        );

        let bare = render_summary(
            2,
            "Timeout",
            "billing",
            Classification::Low,
            None,
            0,
        );
        assert_eq!(bare, "2 Timeout events from billing. Severity: LOW");
    }
}
