//! Environment-derived configuration for the whole process.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use opspulse_ai::{AiClientConfig, AiProvider};
use opspulse_broadcast::HubConfig;
use opspulse_detect::{CriticalService, ScoringConfig, SpikeConfig};
use opspulse_queue::QueueConfig;
use opspulse_resilience::{BreakerConfig, RetryPolicy};
use opspulse_workers::{AggregationConfig, SummarizationConfig};

use crate::rate_limit::RateLimitConfig;

/// Everything the server reads from the environment, parsed once at boot.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Postgres DSN; in-memory stores are used when unset (or when the
    /// `postgres` feature is off).
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
    pub store_timeout: Duration,

    pub aggregation: AggregationConfig,
    pub summarization: SummarizationConfig,
    pub spike: SpikeConfig,
    pub queue: QueueConfig,
    pub hub: HubConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub ai: AiClientConfig,
    pub ai_retry: RetryPolicy,
    pub scoring: ScoringConfig,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable env var, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

fn critical_services_from_env() -> ScoringConfig {
    let Ok(raw) = std::env::var("CRITICAL_SERVICES") else {
        return ScoringConfig::default();
    };
    match serde_json::from_str::<HashMap<String, CriticalService>>(&raw) {
        Ok(map) => ScoringConfig::new(map),
        Err(err) => {
            tracing::warn!(%err, "invalid CRITICAL_SERVICES JSON, using defaults");
            ScoringConfig::default()
        }
    }
}

fn ai_from_env() -> AiClientConfig {
    let provider = match std::env::var("AI_PROVIDER").as_deref() {
        Ok("openai") => AiProvider::OpenAi,
        Ok("claude") | Err(_) => AiProvider::Claude,
        Ok(other) => {
            tracing::warn!(provider = other, "unknown AI_PROVIDER, defaulting to claude");
            AiProvider::Claude
        }
    };
    let api_key = match provider {
        AiProvider::Claude => std::env::var("ANTHROPIC_API_KEY").ok(),
        AiProvider::OpenAi => std::env::var("OPENAI_API_KEY").ok(),
    };
    AiClientConfig {
        provider,
        api_key,
        model: std::env::var("AI_MODEL").ok(),
        timeout: env_millis("AI_TIMEOUT_MS", 60_000),
        max_tokens: env_parse("AI_MAX_TOKENS", 4096),
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let aggregation = AggregationConfig {
            interval: env_millis("AGGREGATION_INTERVAL_MS", 30_000),
            window: env_millis("AGGREGATION_WINDOW_MS", 300_000),
            cleanup_every: env_parse("AGGREGATION_CLEANUP_EVERY", 10),
        };
        let summarization = SummarizationConfig {
            interval: env_millis("SUMMARIZATION_INTERVAL_MS", 30_000),
            batch_size: env_parse("SUMMARIZATION_BATCH_SIZE", 5),
            lookback: env_millis("SUMMARIZATION_LOOKBACK_MS", 24 * 3600 * 1000),
            events_per_incident: env_parse("SUMMARIZATION_EVENTS_PER_INCIDENT", 50),
        };
        let spike = SpikeConfig {
            window_ms: env_parse("SPIKE_WINDOW_MS", 300_000),
            history_windows: env_parse("SPIKE_HISTORY_WINDOWS", 12),
            std_dev_threshold: env_parse("SPIKE_STDDEV_THRESHOLD", 2.0),
            min_data_points: env_parse("SPIKE_MIN_DATA_POINTS", 3),
        };
        let queue = QueueConfig {
            max_queue_size: env_parse("QUEUE_MAX_SIZE", 10_000),
            batch_size: env_parse("QUEUE_BATCH_SIZE", 100),
            batch_interval: env_millis("QUEUE_BATCH_INTERVAL_MS", 1_000),
            broadcast_batch_size: env_parse("BROADCAST_BATCH_SIZE", 10),
            broadcast_batch_interval: env_millis("BROADCAST_BATCH_INTERVAL_MS", 100),
        };
        let hub = HubConfig {
            outbound_buffer: env_parse("BROADCAST_OUTBOUND_BUFFER", 256),
            heartbeat_interval: env_millis("BROADCAST_HEARTBEAT_MS", 30_000),
        };
        let rate_limit = RateLimitConfig {
            window: env_millis("RATE_LIMIT_WINDOW_MS", 60_000),
            max_requests: env_parse("RATE_LIMIT_MAX_REQUESTS", 1_000),
        };
        let breaker = BreakerConfig {
            failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 5),
            success_threshold: env_parse("BREAKER_SUCCESS_THRESHOLD", 2),
            timeout: env_millis("BREAKER_TIMEOUT_MS", 60_000),
        };

        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: std::env::var("DATABASE_URL").ok(),
            use_persistent_stores: env_parse("USE_PERSISTENT_STORES", false),
            store_timeout: env_millis("STORE_TIMEOUT_MS", 5_000),
            aggregation,
            summarization,
            spike,
            queue,
            hub,
            rate_limit,
            breaker,
            ai: ai_from_env(),
            ai_retry: RetryPolicy::default()
                .with_max_retries(env_parse("SUMMARIZATION_MAX_RETRIES", 3)),
            scoring: critical_services_from_env(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            use_persistent_stores: false,
            store_timeout: Duration::from_secs(5),
            aggregation: AggregationConfig::default(),
            summarization: SummarizationConfig::default(),
            spike: SpikeConfig::default(),
            queue: QueueConfig::default(),
            hub: HubConfig::default(),
            rate_limit: RateLimitConfig::default(),
            breaker: BreakerConfig::default(),
            ai: AiClientConfig::default(),
            ai_retry: RetryPolicy::default(),
            scoring: ScoringConfig::default(),
        }
    }
}
