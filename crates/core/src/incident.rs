//! Incidents: coalesced groups of related events.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{EventId, IncidentId};

/// Incident lifecycle state. `Resolved` is terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Active,
    Investigating,
    Resolved,
}

impl IncidentStatus {
    /// Whether the incident can still accrue events and severity.
    pub fn is_open(&self) -> bool {
        matches!(self, IncidentStatus::Active | IncidentStatus::Investigating)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Active => "active",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Resolved => "resolved",
        }
    }
}

impl core::str::FromStr for IncidentStatus {
    type Err = crate::error::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(IncidentStatus::Active),
            "investigating" => Ok(IncidentStatus::Investigating),
            "resolved" => Ok(IncidentStatus::Resolved),
            other => Err(crate::error::DomainError::validation(format!(
                "unknown incident status '{other}'"
            ))),
        }
    }
}

/// A mutable aggregate over events sharing service/error-type affinity.
///
/// Invariants maintained by the mutation helpers below:
/// - `severity_score` never decreases while the incident is open
/// - `event_ids` holds no duplicates and only grows while open
/// - `resolved_at` is set iff `status == Resolved`
/// - `acknowledged_at` is set when `assigned_to` first becomes non-null
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub incident_id: IncidentId,
    /// Ordered references to member events; insertion order, no duplicates.
    pub event_ids: Vec<EventId>,
    pub status: IncidentStatus,
    /// Composite severity level 1..=5.
    pub severity_score: u8,
    pub affected_services: BTreeSet<String>,
    /// Deterministic, locally-generated description. Owned by aggregation.
    pub summary: String,
    /// Model-generated description. Owned by summarization; empty until produced.
    #[serde(default)]
    pub ai_generated_summary: String,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn new(
        event_ids: Vec<EventId>,
        severity_score: u8,
        affected_services: BTreeSet<String>,
        summary: String,
    ) -> Self {
        let now = Utc::now();
        let mut deduped = Vec::with_capacity(event_ids.len());
        let mut seen = BTreeSet::new();
        for id in event_ids {
            if seen.insert(id) {
                deduped.push(id);
            }
        }
        Self {
            incident_id: IncidentId::new(),
            event_ids: deduped,
            status: IncidentStatus::Active,
            severity_score,
            affected_services,
            summary,
            ai_generated_summary: String::new(),
            root_cause: String::new(),
            resolution: String::new(),
            suggested_actions: Vec::new(),
            assigned_to: None,
            created_at: now,
            updated_at: now,
            acknowledged_at: None,
            resolved_at: None,
        }
    }

    /// Append event references, skipping ones already present.
    /// Returns how many were actually added. No-op once resolved.
    pub fn add_events(&mut self, ids: &[EventId]) -> usize {
        if !self.status.is_open() {
            return 0;
        }
        let mut seen: BTreeSet<EventId> = self.event_ids.iter().copied().collect();
        let mut added = 0;
        for id in ids {
            if seen.insert(*id) {
                self.event_ids.push(*id);
                added += 1;
            }
        }
        if added > 0 {
            self.updated_at = Utc::now();
        }
        added
    }

    /// Raise the severity score; lowering is ignored (monotone while open).
    pub fn raise_severity(&mut self, score: u8) {
        if self.status.is_open() && score > self.severity_score {
            self.severity_score = score;
            self.updated_at = Utc::now();
        }
    }

    /// Mark the incident resolved and stamp `resolved_at`.
    pub fn resolve(&mut self) {
        if self.status != IncidentStatus::Resolved {
            self.status = IncidentStatus::Resolved;
            let now = Utc::now();
            self.resolved_at = Some(now);
            self.updated_at = now;
        }
    }

    /// Assign an operator; first assignment stamps `acknowledged_at`.
    pub fn assign(&mut self, operator: impl Into<String>) {
        let now = Utc::now();
        if self.acknowledged_at.is_none() {
            self.acknowledged_at = Some(now);
        }
        self.assigned_to = Some(operator.into());
        self.updated_at = now;
    }
}
