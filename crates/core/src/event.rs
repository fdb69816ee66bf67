//! Ingested operational events.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::{EventId, IncidentId};

/// Event severity on a 1..=5 scale.
///
/// Out-of-range inputs are clamped, never rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Severity(u8);

impl Severity {
    pub const MIN: Severity = Severity(1);
    pub const MAX: Severity = Severity(5);

    /// Clamp an arbitrary integer into the 1..=5 range.
    pub fn clamped(raw: i64) -> Self {
        Self(raw.clamp(1, 5) as u8)
    }

    /// Clamp a float (e.g. an averaged score) into the 1..=5 range, rounding.
    pub fn clamped_f64(raw: f64) -> Self {
        Self((raw.round() as i64).clamp(1, 5) as u8)
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl From<Severity> for u8 {
    fn from(value: Severity) -> Self {
        value.0
    }
}

/// A single observation emitted by an upstream service.
///
/// Immutable once written, except for `incident_id` which is assigned exactly
/// once by the aggregation worker and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: EventId,
    pub service: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    /// Free-form producer payload. Arbitrary JSON tree; the redactor and the
    /// prompt builder are written against this shape.
    #[serde(default)]
    pub metadata: JsonValue,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<IncidentId>,
}

/// Metadata keys probed, in order, when classifying an event.
///
/// Aggregation clustering and AI prompt construction must agree on this list,
/// so it lives here rather than in either worker.
const ERROR_TYPE_KEYS: [&str; 6] = [
    "errorType",
    "error_type",
    "type",
    "category",
    "errorCode",
    "error_code",
];

impl Event {
    pub fn new(service: impl Into<String>, severity: Severity, metadata: JsonValue) -> Self {
        Self {
            event_id: EventId::new(),
            service: service.into(),
            severity,
            timestamp: Utc::now(),
            metadata,
            tags: BTreeSet::new(),
            incident_id: None,
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Classify this event for clustering.
    ///
    /// Returns the first non-empty string under one of [`ERROR_TYPE_KEYS`],
    /// falling back to the synthetic `severity_<n>` bucket.
    pub fn error_type(&self) -> String {
        if let Some(map) = self.metadata.as_object() {
            for key in ERROR_TYPE_KEYS {
                if let Some(v) = map.get(key).and_then(|v| v.as_str()) {
                    if !v.is_empty() {
                        return v.to_string();
                    }
                }
            }
        }
        format!("severity_{}", self.severity.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn severity_clamps_out_of_range_values() {
        assert_eq!(Severity::clamped(0).get(), 1);
        assert_eq!(Severity::clamped(-7).get(), 1);
        assert_eq!(Severity::clamped(3).get(), 3);
        assert_eq!(Severity::clamped(99).get(), 5);
        assert_eq!(Severity::clamped_f64(3.6).get(), 4);
    }

    #[test]
    fn error_type_prefers_earlier_keys() {
        let e = Event::new(
            "orders",
            Severity::clamped(3),
            json!({"category": "Timeout", "errorType": "DeadlockDetected"}),
        );
        assert_eq!(e.error_type(), "DeadlockDetected");
    }

    #[test]
    fn error_type_skips_empty_strings() {
        let e = Event::new(
            "orders",
            Severity::clamped(3),
            json!({"errorType": "", "type": "Timeout"}),
        );
        assert_eq!(e.error_type(), "Timeout");
    }

    #[test]
    fn error_type_falls_back_to_severity_bucket() {
        let e = Event::new("orders", Severity::clamped(4), json!({"latency_ms": 250}));
        assert_eq!(e.error_type(), "severity_4");

        let scalar = Event::new("orders", Severity::clamped(2), json!("not a map"));
        assert_eq!(scalar.error_type(), "severity_2");
    }
}
