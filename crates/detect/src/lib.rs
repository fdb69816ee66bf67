//! Anomaly detection: per-service rate spikes and severity scoring.

pub mod scoring;
pub mod spike;

pub use scoring::{
    Classification, CriticalService, FrequencyLevel, IncidentScore, ScoringConfig, SpikeContext,
    score_event, score_incident,
};
pub use spike::{SpikeConfig, SpikeDetector, SpikeLevel, SpikeResult};
