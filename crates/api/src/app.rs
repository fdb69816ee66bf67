//! Application wiring: stores, queue, hub, workers, router.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower::ServiceBuilder;

use opspulse_ai::AiClient;
use opspulse_broadcast::{BroadcastHub, HeartbeatHandle, spawn_heartbeat};
use opspulse_detect::SpikeDetector;
use opspulse_queue::{EventQueue, QueueHandle};
use opspulse_resilience::CircuitBreaker;
use opspulse_store::{EventStore, IncidentStore, InMemoryStore, StatsStore};
use opspulse_workers::{
    AggregationWorker, SummarizationWorker, WorkerHandle,
};

use crate::config::ApiConfig;
use crate::rate_limit::{PruneHandle, RateLimiter, spawn_prune};
use crate::routes;
use crate::ws;

/// Shared handler state. Every field is an `Arc`; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub events: Arc<dyn EventStore>,
    pub incidents: Arc<dyn IncidentStore>,
    pub queue: Arc<EventQueue>,
    pub hub: Arc<BroadcastHub>,
    pub breaker: Arc<CircuitBreaker>,
    pub summarizer: Arc<SummarizationWorker>,
    pub limiter: Arc<RateLimiter>,
}

/// Handles to every background task, shut down in dependency order.
pub struct ServerHandles {
    aggregation: WorkerHandle,
    summarization: WorkerHandle,
    heartbeat: HeartbeatHandle,
    prune: PruneHandle,
    queue: QueueHandle,
}

impl ServerHandles {
    /// Stop workers first, then the hub heartbeat, then flush the queue.
    pub async fn shutdown(self) {
        self.aggregation.shutdown().await;
        self.summarization.shutdown().await;
        self.prune.shutdown().await;
        self.heartbeat.shutdown().await;
        self.queue.shutdown().await;
    }
}

type Stores = (
    Arc<dyn EventStore>,
    Arc<dyn IncidentStore>,
    Arc<dyn StatsStore>,
);

#[cfg(feature = "postgres")]
async fn build_stores(config: &ApiConfig) -> anyhow::Result<Stores> {
    if config.use_persistent_stores {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true"))?;
        let store = Arc::new(
            opspulse_store::PostgresStore::connect(url, config.store_timeout).await?,
        );
        tracing::info!("using postgres stores");
        return Ok((store.clone(), store.clone(), store));
    }
    let store = Arc::new(InMemoryStore::new());
    Ok((store.clone(), store.clone(), store))
}

#[cfg(not(feature = "postgres"))]
async fn build_stores(config: &ApiConfig) -> anyhow::Result<Stores> {
    if config.use_persistent_stores {
        tracing::warn!(
            "USE_PERSISTENT_STORES=true but the postgres feature is not enabled, using in-memory"
        );
    }
    let store = Arc::new(InMemoryStore::new());
    Ok((store.clone(), store.clone(), store))
}

/// Build the full application: stores, pipeline, workers, and the router.
pub async fn build(config: ApiConfig) -> anyhow::Result<(Router, AppState, ServerHandles)> {
    let config = Arc::new(config);
    let (events, incidents, stats) = build_stores(&config).await?;

    let hub = Arc::new(BroadcastHub::new(config.hub.clone()));
    let heartbeat = spawn_heartbeat(hub.clone());

    let queue = Arc::new(EventQueue::new(config.queue.clone()));
    let queue_handle = opspulse_queue::start(queue.clone(), events.clone(), hub.clone());

    let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
    let ai = Arc::new(AiClient::new(
        config.ai.clone(),
        breaker.clone(),
        config.ai_retry.clone(),
    ));

    let aggregation = AggregationWorker::new(
        config.aggregation.clone(),
        events.clone(),
        incidents.clone(),
        SpikeDetector::new(config.spike.clone(), stats),
        config.scoring.clone(),
        hub.clone(),
    )
    .spawn();

    let summarizer = Arc::new(SummarizationWorker::new(
        config.summarization.clone(),
        events.clone(),
        incidents.clone(),
        ai,
        hub.clone(),
        queue.clone(),
    ));
    let summarization = summarizer.clone().spawn();

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let prune = spawn_prune(limiter.clone());

    let state = AppState {
        config,
        events,
        incidents,
        queue,
        hub,
        breaker,
        summarizer,
        limiter,
    };

    let router = build_router(state.clone());
    let handles = ServerHandles {
        aggregation,
        summarization,
        heartbeat,
        prune,
        queue: queue_handle,
    };
    Ok((router, state, handles))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/events",
            post(routes::events::ingest).get(routes::events::list),
        )
        .route("/events/stats", get(routes::events::stats))
        .route("/events/:id", get(routes::events::get_by_id))
        .route("/incidents", get(routes::incidents::list))
        .route("/incidents/active", get(routes::incidents::active))
        .route(
            "/incidents/:id",
            get(routes::incidents::get_by_id).patch(routes::incidents::update),
        )
        .route("/ai/summarize/:id", post(routes::ai::summarize))
        .route("/ai/circuit-breaker", get(routes::ai::breaker_status))
        .route("/ai/circuit-breaker/reset", post(routes::ai::breaker_reset))
        .route("/ws", get(ws::ws_handler))
        .layer(ServiceBuilder::new())
        .with_state(state)
}
