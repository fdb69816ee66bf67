//! Severity scoring: pure functions from events (plus optional spike
//! context) to bounded scores. No I/O.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use opspulse_core::Event;

use crate::spike::SpikeResult;

/// Per-event base score by severity 1..=5.
const BASE_SCORES: [u32; 5] = [10, 25, 50, 75, 100];

/// A service whose failures carry extra weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalService {
    pub multiplier: f64,
    /// Event count at which operators expect an alert; surfaced in config,
    /// not used by the scorer itself.
    pub alert_threshold: u64,
}

/// Scoring configuration: critical-service weighting.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// Keyed by lowercased service name.
    critical_services: HashMap<String, CriticalService>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let entries = [
            ("payment-service", 2.0, 10),
            ("auth-service", 1.8, 15),
            ("database", 1.7, 20),
            ("api-gateway", 1.5, 30),
        ];
        Self {
            critical_services: entries
                .into_iter()
                .map(|(name, multiplier, alert_threshold)| {
                    (
                        name.to_string(),
                        CriticalService {
                            multiplier,
                            alert_threshold,
                        },
                    )
                })
                .collect(),
        }
    }
}

impl ScoringConfig {
    pub fn new(critical_services: HashMap<String, CriticalService>) -> Self {
        Self {
            critical_services: critical_services
                .into_iter()
                .map(|(name, svc)| (name.to_lowercase(), svc))
                .collect(),
        }
    }

    /// Case-insensitive multiplier lookup; unknown services weigh 1.0.
    pub fn service_multiplier(&self, service: &str) -> f64 {
        self.critical_services
            .get(&service.to_lowercase())
            .map(|svc| svc.multiplier)
            .unwrap_or(1.0)
    }

    pub fn critical_services(&self) -> &HashMap<String, CriticalService> {
        &self.critical_services
    }
}

/// Per-service rate context for frequency weighting.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SpikeContext {
    pub current_count: f64,
    pub mean: f64,
}

impl From<&SpikeResult> for SpikeContext {
    fn from(result: &SpikeResult) -> Self {
        Self {
            current_count: result.current as f64,
            mean: result.mean,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

/// Frequency multiplier from the current-to-baseline ratio.
fn frequency_factor(spike: Option<&SpikeContext>) -> (f64, FrequencyLevel) {
    let Some(ctx) = spike else {
        return (1.0, FrequencyLevel::Normal);
    };
    if ctx.mean <= 0.0 {
        // No baseline yet; any traffic reads as elevated, not critical.
        return if ctx.current_count > 0.0 {
            (1.3, FrequencyLevel::Elevated)
        } else {
            (1.0, FrequencyLevel::Normal)
        };
    }
    let ratio = ctx.current_count / ctx.mean.max(f64::EPSILON);
    if ratio >= 4.0 {
        (2.0, FrequencyLevel::Critical)
    } else if ratio >= 2.5 {
        (1.6, FrequencyLevel::High)
    } else if ratio >= 1.5 {
        (1.3, FrequencyLevel::Elevated)
    } else {
        (1.0, FrequencyLevel::Normal)
    }
}

/// Breakdown of a single event's score.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScore {
    pub base: u32,
    pub service_multiplier: f64,
    pub frequency_multiplier: f64,
    pub frequency_level: FrequencyLevel,
    /// `min(round(base · service · frequency), 100)`.
    pub final_score: u32,
}

pub fn score_event(
    event: &Event,
    spike: Option<&SpikeContext>,
    config: &ScoringConfig,
) -> EventScore {
    let base = BASE_SCORES[(event.severity.get() as usize) - 1];
    let service_multiplier = config.service_multiplier(&event.service);
    let (frequency_multiplier, frequency_level) = frequency_factor(spike);
    let raw = (base as f64) * service_multiplier * frequency_multiplier;
    EventScore {
        base,
        service_multiplier,
        frequency_multiplier,
        frequency_level,
        final_score: (raw.round() as u32).min(100),
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Low,
    Medium,
    High,
    Critical,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Low => "low",
            Classification::Medium => "medium",
            Classification::High => "high",
            Classification::Critical => "critical",
        }
    }
}

/// Composite score for a set of events forming (or extending) an incident.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentScore {
    /// 0..=100.
    pub composite: u32,
    pub max_score: u32,
    pub avg_score: f64,
    /// 1..=5, the incident's `severity_score`.
    pub level: u8,
    pub classification: Classification,
}

impl IncidentScore {
    fn empty() -> Self {
        Self {
            composite: 0,
            max_score: 0,
            avg_score: 0.0,
            level: 1,
            classification: Classification::Low,
        }
    }
}

/// Score a cluster of events.
///
/// `spikes` maps service name to its rate context; events from services
/// without an entry score at normal frequency.
pub fn score_incident(
    events: &[Event],
    spikes: &BTreeMap<String, SpikeContext>,
    config: &ScoringConfig,
) -> IncidentScore {
    if events.is_empty() {
        return IncidentScore::empty();
    }

    let scores: Vec<u32> = events
        .iter()
        .map(|event| score_event(event, spikes.get(&event.service), config).final_score)
        .collect();

    let max_score = *scores.iter().max().unwrap_or(&0);
    let avg_score = scores.iter().sum::<u32>() as f64 / scores.len() as f64;

    let count_factor = (1.0 + 0.2 * (scores.len() as f64).log10()).min(1.5);
    let weighted = (0.6 * max_score as f64 + 0.4 * avg_score) * count_factor;
    let composite = (weighted.round() as u32).min(100);

    let level = match composite {
        90..=u32::MAX => 5,
        75..=89 => 4,
        50..=74 => 3,
        25..=49 => 2,
        _ => 1,
    };
    let classification = match composite {
        90..=u32::MAX => Classification::Critical,
        75..=89 => Classification::High,
        50..=74 => Classification::Medium,
        _ => Classification::Low,
    };

    IncidentScore {
        composite,
        max_score,
        avg_score,
        level,
        classification,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use opspulse_core::Severity;

    fn event(service: &str, severity: i64) -> Event {
        Event::new(service, Severity::clamped(severity), json!({}))
    }

    #[test]
    fn critical_service_under_spike_maxes_out() {
        let config = ScoringConfig::default();
        let spike = SpikeContext {
            current_count: 50.0,
            mean: 10.0,
        };
        let score = score_event(&event("payment-service", 4), Some(&spike), &config);
        assert_eq!(score.base, 75);
        assert_eq!(score.service_multiplier, 2.0);
        assert_eq!(score.frequency_multiplier, 2.0);
        assert_eq!(score.frequency_level, FrequencyLevel::Critical);
        assert_eq!(score.final_score, 100);
    }

    #[test]
    fn service_lookup_is_case_insensitive() {
        let config = ScoringConfig::default();
        let score = score_event(&event("Payment-Service", 2), None, &config);
        assert_eq!(score.final_score, 50);
    }

    #[test]
    fn frequency_tiers() {
        let tiers = [
            (14.0, 1.0, FrequencyLevel::Normal),
            (15.0, 1.3, FrequencyLevel::Elevated),
            (25.0, 1.6, FrequencyLevel::High),
            (40.0, 2.0, FrequencyLevel::Critical),
        ];
        for (current, expected_mul, expected_level) in tiers {
            let (mul, level) = frequency_factor(Some(&SpikeContext {
                current_count: current,
                mean: 10.0,
            }));
            assert_eq!(mul, expected_mul, "current={current}");
            assert_eq!(level, expected_level);
        }
    }

    #[test]
    fn zero_baseline_with_traffic_is_elevated_not_critical() {
        let (mul, level) = frequency_factor(Some(&SpikeContext {
            current_count: 7.0,
            mean: 0.0,
        }));
        assert_eq!(mul, 1.3);
        assert_eq!(level, FrequencyLevel::Elevated);
    }

    #[test]
    fn empty_incident_scores_zero() {
        let score = score_incident(&[], &BTreeMap::new(), &ScoringConfig::default());
        assert_eq!(score.composite, 0);
        assert_eq!(score.level, 1);
        assert_eq!(score.classification, Classification::Low);
    }

    #[test]
    fn single_event_incident_uses_its_score() {
        let config = ScoringConfig::default();
        let score = score_incident(&[event("orders", 3)], &BTreeMap::new(), &config);
        // 0.6*50 + 0.4*50 = 50, count factor 1.0
        assert_eq!(score.composite, 50);
        assert_eq!(score.level, 3);
        assert_eq!(score.classification, Classification::Medium);
    }

    #[test]
    fn count_factor_caps_at_one_point_five() {
        let config = ScoringConfig::default();
        let events: Vec<Event> = (0..1000).map(|_| event("orders", 5)).collect();
        let score = score_incident(&events, &BTreeMap::new(), &config);
        assert_eq!(score.composite, 100);

        let few: Vec<Event> = (0..10).map(|_| event("orders", 1)).collect();
        let low = score_incident(&few, &BTreeMap::new(), &config);
        // 10 events of base 10: (0.6*10 + 0.4*10) * 1.2 = 12
        assert_eq!(low.composite, 12);
        assert_eq!(low.level, 1);
    }

    #[test]
    fn composite_is_bounded_and_deterministic() {
        let config = ScoringConfig::default();
        let events = vec![
            event("payment-service", 5),
            event("orders", 2),
            event("billing", 4),
        ];
        let spikes = BTreeMap::from([(
            "payment-service".to_string(),
            SpikeContext {
                current_count: 80.0,
                mean: 10.0,
            },
        )]);
        let first = score_incident(&events, &spikes, &config);
        let second = score_incident(&events, &spikes, &config);
        assert_eq!(first, second);
        assert!(first.composite <= 100);
        assert!((1..=5).contains(&first.level));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn scores_stay_in_bounds(
                severities in proptest::collection::vec(1i64..=5, 0..40),
                current in 0u64..10_000,
                mean in 0u64..1_000,
            ) {
                let config = ScoringConfig::default();
                let events: Vec<Event> =
                    severities.iter().map(|&s| event("payment-service", s)).collect();
                let spikes = BTreeMap::from([(
                    "payment-service".to_string(),
                    SpikeContext { current_count: current as f64, mean: mean as f64 },
                )]);
                let score = score_incident(&events, &spikes, &config);
                prop_assert!(score.composite <= 100);
                prop_assert!((1..=5).contains(&score.level));
            }
        }
    }
}
