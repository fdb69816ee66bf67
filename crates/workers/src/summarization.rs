//! Batched AI summarization of open incidents.
//!
//! Every tick: pick open incidents without an AI summary, redact their
//! events, call the model in batches under the circuit breaker, write the
//! results back, and broadcast. Incidents the model misses get the
//! deterministic fallback so the UI never waits on a retry loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;

use opspulse_ai::{
    AiClient, IncidentBundle, IncidentSummary, SYSTEM_PROMPT, build_batch_prompt,
    build_single_prompt, fallback_summary, parse_batch_response, parse_single_response,
};
use opspulse_broadcast::{BroadcastHub, IncidentAction};
use opspulse_core::{Incident, IncidentId};
use opspulse_queue::EventQueue;
use opspulse_resilience::BreakerError;
use opspulse_store::{EventStore, IncidentPatch, IncidentStore, StoreError};

use crate::handle::WorkerHandle;

#[derive(Debug, Clone)]
pub struct SummarizationConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// Only incidents created within this window are candidates.
    pub lookback: Duration,
    /// Newest events fetched per incident for the prompt.
    pub events_per_incident: usize,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 5,
            lookback: Duration::from_secs(24 * 3600),
            events_per_incident: 50,
        }
    }
}

/// Why a manual summarization request did not produce a model summary.
#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("incident not found")]
    NotFound,

    #[error("ai circuit breaker is open, retry in {retry_after:?}")]
    BreakerOpen { retry_after: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one scheduled tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub skipped: bool,
    pub candidates: usize,
    pub summarized: usize,
    pub fallbacks: usize,
}

pub struct SummarizationWorker {
    config: SummarizationConfig,
    events: Arc<dyn EventStore>,
    incidents: Arc<dyn IncidentStore>,
    ai: Arc<AiClient>,
    redactor: opspulse_redact::Redactor,
    hub: Arc<BroadcastHub>,
    /// Queue telemetry: a loaded ingest path defers AI work for a tick.
    queue: Arc<EventQueue>,
}

impl SummarizationWorker {
    pub fn new(
        config: SummarizationConfig,
        events: Arc<dyn EventStore>,
        incidents: Arc<dyn IncidentStore>,
        ai: Arc<AiClient>,
        hub: Arc<BroadcastHub>,
        queue: Arc<EventQueue>,
    ) -> Self {
        Self {
            config,
            events,
            incidents,
            ai,
            redactor: opspulse_redact::Redactor::new(),
            hub,
            queue,
        }
    }

    /// One scheduled pass over summary-needing incidents.
    pub async fn run_once(&self) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();

        if self.queue.under_pressure() {
            tracing::debug!("ingest queue under pressure, skipping AI summarization tick");
            report.skipped = true;
            return Ok(report);
        }
        if !self.ai.available() {
            tracing::debug!("ai client unavailable, skipping summarization tick");
            report.skipped = true;
            return Ok(report);
        }

        let lookback = chrono::Duration::from_std(self.config.lookback)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        // Over-fetch so one failing batch does not starve the tick.
        let candidates = self
            .incidents
            .find_summary_needed(Utc::now() - lookback, self.config.batch_size * 3)
            .await?;
        report.candidates = candidates.len();
        if candidates.is_empty() {
            return Ok(report);
        }

        for batch in candidates.chunks(self.config.batch_size.max(1)) {
            let bundles = self.bundle(batch).await?;
            let prompt = build_batch_prompt(&bundles);

            match self.ai.complete(SYSTEM_PROMPT, &prompt).await {
                Ok(completion) => {
                    let summaries = match parse_batch_response(&completion.text) {
                        Ok(parsed) => parsed
                            .into_iter()
                            .filter_map(|s| s.incident_id.clone().map(|id| (id, s)))
                            .collect::<HashMap<_, _>>(),
                        Err(err) => {
                            tracing::warn!(%err, "unparseable batch response, falling back");
                            HashMap::new()
                        }
                    };
                    for bundle in &bundles {
                        let id = bundle.incident.incident_id;
                        let (summary, is_fallback) = match summaries.get(&id.to_string()) {
                            Some(parsed) => (parsed.clone(), false),
                            None => (fallback_summary(&bundle.incident), true),
                        };
                        self.apply(id, &summary).await?;
                        if is_fallback {
                            report.fallbacks += 1;
                        } else {
                            report.summarized += 1;
                        }
                    }
                }
                Err(BreakerError::Open { retry_after }) => {
                    tracing::warn!(
                        ?retry_after,
                        "breaker opened mid-tick, remaining incidents get fallbacks"
                    );
                    self.apply_fallbacks(&bundles, &mut report).await?;
                    break;
                }
                Err(BreakerError::Inner(err)) => {
                    tracing::warn!(%err, "ai batch failed, applying fallbacks");
                    self.apply_fallbacks(&bundles, &mut report).await?;
                }
            }
        }

        Ok(report)
    }

    /// Manual trigger for a single incident. Honors the breaker; a missing
    /// API key degrades to the deterministic fallback.
    pub async fn summarize_one(&self, id: IncidentId) -> Result<Incident, SummarizeError> {
        let incident = self
            .incidents
            .get_incident(id)
            .await?
            .ok_or(SummarizeError::NotFound)?;

        // Breaker state gates even manual triggers; a missing key degrades
        // straight to the fallback without touching the breaker.
        if self.ai.configured() && !self.ai.breaker().can_execute() {
            let snapshot = self.ai.breaker().snapshot();
            let retry_after = snapshot
                .next_attempt_at
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or(Duration::from_secs(30));
            return Err(SummarizeError::BreakerOpen { retry_after });
        }

        let summary = if !self.ai.configured() {
            tracing::debug!("no ai provider configured, using fallback");
            fallback_summary(&incident)
        } else {
            let bundles = self.bundle(std::slice::from_ref(&incident)).await?;
            let prompt = build_single_prompt(&bundles[0]);
            match self.ai.complete(SYSTEM_PROMPT, &prompt).await {
                Ok(completion) => match parse_single_response(&completion.text) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!(%err, incident = %id, "unparseable response, falling back");
                        fallback_summary(&incident)
                    }
                },
                Err(BreakerError::Open { retry_after }) => {
                    return Err(SummarizeError::BreakerOpen { retry_after });
                }
                Err(BreakerError::Inner(err)) => {
                    tracing::warn!(%err, incident = %id, "ai call failed, using fallback");
                    fallback_summary(&incident)
                }
            }
        };

        let updated = self
            .apply(id, &summary)
            .await?
            .ok_or(SummarizeError::NotFound)?;
        Ok(updated)
    }

    /// Fetch + redact the newest events for each incident.
    async fn bundle(&self, incidents: &[Incident]) -> Result<Vec<IncidentBundle>, StoreError> {
        let mut bundles = Vec::with_capacity(incidents.len());
        for incident in incidents {
            let events = self
                .events
                .find_by_ids(&incident.event_ids, self.config.events_per_incident)
                .await?;
            let (redacted, counts) = self.redactor.redact_events(&events);
            if counts.total() > 0 {
                tracing::debug!(
                    incident = %incident.incident_id,
                    replacements = counts.total(),
                    fields = counts.fields_redacted,
                    "redacted event metadata before prompt"
                );
            }
            bundles.push(IncidentBundle {
                incident: incident.clone(),
                events: redacted,
            });
        }
        Ok(bundles)
    }

    /// Write a summary back and notify subscribers.
    async fn apply(
        &self,
        id: IncidentId,
        summary: &IncidentSummary,
    ) -> Result<Option<Incident>, StoreError> {
        let patch = IncidentPatch {
            ai_generated_summary: Some(summary.summary_text()),
            root_cause: Some(summary.root_cause.clone()),
            suggested_actions: Some(summary.suggested_actions.clone()),
            ..Default::default()
        };
        let updated = self.incidents.update(id, &patch).await?;
        if let Some(incident) = &updated {
            self.hub
                .publish_incident(incident, IncidentAction::SummaryUpdated);
        }
        Ok(updated)
    }

    async fn apply_fallbacks(
        &self,
        bundles: &[IncidentBundle],
        report: &mut TickReport,
    ) -> Result<(), StoreError> {
        for bundle in bundles {
            let fallback = fallback_summary(&bundle.incident);
            self.apply(bundle.incident.incident_id, &fallback).await?;
            report.fallbacks += 1;
        }
        Ok(())
    }

    /// Spawn the periodic loop. The worker is shared so the manual-trigger
    /// surface can reuse `summarize_one` on the same breaker and stores.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
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
                            Ok(report) if report.candidates > 0 => {
                                tracing::info!(
                                    candidates = report.candidates,
                                    summarized = report.summarized,
                                    fallbacks = report.fallbacks,
                                    "summarization tick complete"
                                );
                            }
                            Ok(_) => {}
                            Err(err) => tracing::error!(%err, "summarization tick failed"),
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    use opspulse_ai::{AiClientConfig, AiProvider};
    use opspulse_broadcast::{HubConfig, Outbound, ServerFrame};
    use opspulse_core::{Event, Severity};
    use opspulse_queue::QueueConfig;
    use opspulse_resilience::{BreakerConfig, CircuitBreaker, RetryPolicy};
    use opspulse_store::InMemoryStore;

    fn ai_client(api_key: Option<&str>) -> Arc<AiClient> {
        Arc::new(AiClient::new(
            AiClientConfig {
                provider: AiProvider::Claude,
                api_key: api_key.map(|k| k.to_string()),
                ..Default::default()
            },
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            RetryPolicy::default(),
        ))
    }

    fn worker(
        store: &Arc<InMemoryStore>,
        ai: Arc<AiClient>,
        hub: Arc<BroadcastHub>,
        queue: Arc<EventQueue>,
    ) -> SummarizationWorker {
        SummarizationWorker::new(
            SummarizationConfig::default(),
            store.clone() as Arc<dyn EventStore>,
            store.clone() as Arc<dyn IncidentStore>,
            ai,
            hub,
            queue,
        )
    }

    async fn seeded_incident(store: &Arc<InMemoryStore>) -> Incident {
        let event = Event::new(
            "orders",
            Severity::clamped(4),
            json!({"errorType": "Timeout", "email": "a@b.com"}),
        );
        store.insert_many(vec![event.clone()]).await.unwrap();
        let incident = Incident::new(
            vec![event.event_id],
            3,
            BTreeSet::from(["orders".to_string()]),
            "1 Timeout events from orders. Severity: MEDIUM".to_string(),
        );
        store.create(&incident).await.unwrap();
        incident
    }

    #[tokio::test]
    async fn tick_skips_without_api_key() {
        let store = Arc::new(InMemoryStore::new());
        seeded_incident(&store).await;
        let hub = Arc::new(BroadcastHub::new(HubConfig::default()));
        let queue = Arc::new(EventQueue::new(QueueConfig::default()));
        let w = worker(&store, ai_client(None), hub, queue);

        let report = w.run_once().await.unwrap();
        assert!(report.skipped);

        // Untouched: still a candidate for when AI comes back.
        let needing = store
            .find_summary_needed(Utc::now() - chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(needing.len(), 1);
    }

    #[tokio::test]
    async fn tick_skips_under_queue_pressure() {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(BroadcastHub::new(HubConfig::default()));
        let queue = Arc::new(EventQueue::new(QueueConfig {
            max_queue_size: 10,
            ..Default::default()
        }));
        for _ in 0..9 {
            queue.enqueue(Event::new("x", Severity::clamped(1), json!({})));
        }
        let w = worker(&store, ai_client(Some("key")), hub, queue);

        let report = w.run_once().await.unwrap();
        assert!(report.skipped);
    }

    #[tokio::test]
    async fn manual_trigger_rejects_when_breaker_open() {
        let store = Arc::new(InMemoryStore::new());
        let incident = seeded_incident(&store).await;
        let hub = Arc::new(BroadcastHub::new(HubConfig::default()));
        let queue = Arc::new(EventQueue::new(QueueConfig::default()));
        let ai = ai_client(Some("key"));
        ai.breaker().trip();
        let w = worker(&store, ai, hub, queue);

        let result = w.summarize_one(incident.incident_id).await;
        assert!(matches!(result, Err(SummarizeError::BreakerOpen { .. })));
    }

    #[tokio::test]
    async fn manual_trigger_without_key_writes_fallback_and_broadcasts() {
        let store = Arc::new(InMemoryStore::new());
        let incident = seeded_incident(&store).await;
        let hub = Arc::new(BroadcastHub::new(HubConfig::default()));
        let (_, mut rx) = hub.attach();
        let queue = Arc::new(EventQueue::new(QueueConfig::default()));
        let w = worker(&store, ai_client(None), hub.clone(), queue);

        let updated = w.summarize_one(incident.incident_id).await.unwrap();
        assert!(
            updated
                .ai_generated_summary
                .contains("AI summary unavailable")
        );
        assert_eq!(updated.suggested_actions.len(), 3);

        let mut saw_summary_update = false;
        while let Ok(frame) = rx.try_recv() {
            if let Outbound::Frame(ServerFrame::Incident { action, .. }) = frame {
                if action == IncidentAction::SummaryUpdated {
                    saw_summary_update = true;
                }
            }
        }
        assert!(saw_summary_update);

        // No longer a candidate.
        let needing = store
            .find_summary_needed(Utc::now() - chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert!(needing.is_empty());
    }

    #[tokio::test]
    async fn missing_incident_is_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let hub = Arc::new(BroadcastHub::new(HubConfig::default()));
        let queue = Arc::new(EventQueue::new(QueueConfig::default()));
        let w = worker(&store, ai_client(None), hub, queue);
        let result = w.summarize_one(IncidentId::new()).await;
        assert!(matches!(result, Err(SummarizeError::NotFound)));
    }

    #[tokio::test]
    async fn bundles_redact_metadata_before_prompting() {
        let store = Arc::new(InMemoryStore::new());
        let incident = seeded_incident(&store).await;
        let hub = Arc::new(BroadcastHub::new(HubConfig::default()));
        let queue = Arc::new(EventQueue::new(QueueConfig::default()));
        let w = worker(&store, ai_client(None), hub, queue);

        let bundles = w.bundle(std::slice::from_ref(&incident)).await.unwrap();
        assert_eq!(bundles[0].events.len(), 1);
        assert_eq!(
            bundles[0].events[0].metadata["email"],
            json!("[REDACTED_EMAIL]")
        );
    }
}
