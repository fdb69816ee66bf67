//! Per-service rolling event-rate anomaly detector.
//!
//! Counts live in the stats store keyed by fixed-width window, so detection
//! state survives restarts. Detection itself is a pure z-score test over the
//! retained windows.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use opspulse_core::window_key;
use opspulse_store::{StatsStore, StoreError};

#[derive(Debug, Clone)]
pub struct SpikeConfig {
    /// Width of one counting window.
    pub window_ms: i64,
    /// How many windows back the baseline looks.
    pub history_windows: usize,
    /// Spike when `current > mean + threshold · stddev`.
    pub std_dev_threshold: f64,
    /// Minimum retained windows before any verdict.
    pub min_data_points: usize,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            window_ms: 300_000,
            history_windows: 12,
            std_dev_threshold: 2.0,
            min_data_points: 3,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

impl SpikeLevel {
    fn from_deviations(d: f64) -> Self {
        if d >= 4.0 {
            SpikeLevel::Critical
        } else if d >= 3.0 {
            SpikeLevel::High
        } else if d >= 2.0 {
            SpikeLevel::Elevated
        } else {
            SpikeLevel::Normal
        }
    }
}

/// Verdict for one service at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpikeResult {
    pub is_spike: bool,
    pub level: SpikeLevel,
    /// `(current - mean) / stddev`; 0 when stddev is 0.
    pub deviations: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub current: u64,
    pub has_enough_data: bool,
}

impl SpikeResult {
    fn insufficient(current: u64) -> Self {
        Self {
            is_spike: false,
            level: SpikeLevel::Normal,
            deviations: 0.0,
            mean: 0.0,
            std_dev: 0.0,
            current,
            has_enough_data: false,
        }
    }
}

/// Statistics over retained window counts.
fn baseline(counts: &[u64]) -> (f64, f64) {
    let n = counts.len() as f64;
    let mean = counts.iter().sum::<u64>() as f64 / n;
    let variance = counts
        .iter()
        .map(|&c| {
            let d = c as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

/// Store-backed spike detector.
///
/// Degrades on store failure: callers always get a result, never an error.
/// A broken stats backend reads as "not enough data".
#[derive(Debug)]
pub struct SpikeDetector<S> {
    config: SpikeConfig,
    store: S,
}

impl<S: StatsStore> SpikeDetector<S> {
    pub fn new(config: SpikeConfig, store: S) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &SpikeConfig {
        &self.config
    }

    /// Add `n` observations for `service` into the window containing `at`.
    pub async fn record_count(
        &self,
        service: &str,
        n: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = window_key(at, self.config.window_ms);
        self.store.upsert_count(service, &key, n).await
    }

    /// Record a whole per-service tally in one pass. Failures are logged per
    /// service and do not abort the rest.
    pub async fn record_counts(&self, counts: &BTreeMap<String, u64>, at: DateTime<Utc>) {
        for (service, &n) in counts {
            if n == 0 {
                continue;
            }
            if let Err(err) = self.record_count(service, n, at).await {
                tracing::warn!(%service, %err, "failed to record window count");
            }
        }
    }

    /// Z-score test for `service` at `current_count` events.
    pub async fn is_spike(&self, service: &str, current_count: u64) -> SpikeResult {
        let rows = match self
            .store
            .find_recent(service, self.config.history_windows)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(%service, %err, "stats lookup failed, treating as insufficient data");
                return SpikeResult::insufficient(current_count);
            }
        };

        if rows.len() < self.config.min_data_points {
            return SpikeResult::insufficient(current_count);
        }

        let counts: Vec<u64> = rows.iter().map(|r| r.count).collect();
        let (mean, std_dev) = baseline(&counts);
        let threshold = mean + std_dev * self.config.std_dev_threshold;
        let is_spike = std_dev > 0.0 && (current_count as f64) > threshold;
        let deviations = if std_dev > 0.0 {
            (current_count as f64 - mean) / std_dev
        } else {
            0.0
        };

        SpikeResult {
            is_spike,
            level: SpikeLevel::from_deviations(deviations),
            deviations,
            mean,
            std_dev,
            current: current_count,
            has_enough_data: true,
        }
    }

    /// Evaluate every service in `counts`.
    pub async fn check_spikes(
        &self,
        counts: &BTreeMap<String, u64>,
    ) -> BTreeMap<String, SpikeResult> {
        let mut out = BTreeMap::new();
        for (service, &n) in counts {
            out.insert(service.clone(), self.is_spike(service, n).await);
        }
        out
    }

    /// Drop windows past twice the retention horizon.
    pub async fn cleanup(&self) -> Result<u64, StoreError> {
        let horizon_ms = 2 * self.config.window_ms * self.config.history_windows as i64;
        let cutoff = Utc::now() - Duration::milliseconds(horizon_ms);
        self.store.delete_older_than(cutoff).await
    }
}
