//! Rolling per-service event-rate counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One rolling-window counter row, unique on `(service, window_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub service: String,
    /// Canonical bucket identifier, see [`window_key`].
    pub window_key: String,
    pub count: u64,
    /// Last touch time; drives TTL expiry.
    pub timestamp: DateTime<Utc>,
}

/// Millisecond timestamp of the window containing `at`.
pub fn window_start_ms(at: DateTime<Utc>, window_ms: i64) -> i64 {
    let ms = at.timestamp_millis();
    ms.div_euclid(window_ms) * window_ms
}

/// Canonical window key: `"w_" + floor(ms / window) * window`.
pub fn window_key(at: DateTime<Utc>, window_ms: i64) -> String {
    format!("w_{}", window_start_ms(at, window_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_key_is_stable_within_a_window() {
        let window = 300_000;
        let a = Utc.timestamp_millis_opt(1_700_000_012_345).unwrap();
        let b = Utc.timestamp_millis_opt(1_700_000_099_000).unwrap();
        assert_eq!(window_key(a, window), window_key(b, window));
        assert_eq!(window_key(a, window), "w_1699999800000");
    }

    #[test]
    fn window_key_changes_across_boundaries() {
        let window = 300_000;
        let a = Utc.timestamp_millis_opt(1_700_000_099_999).unwrap();
        let b = Utc.timestamp_millis_opt(1_700_000_100_000).unwrap();
        assert_ne!(window_key(a, window), window_key(b, window));
    }
}
