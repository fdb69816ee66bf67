use std::net::SocketAddr;

use opspulse_api::app;
use opspulse_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    opspulse_observability::init();

    let config = ApiConfig::from_env();
    let bind_addr = config.bind_addr.clone();
    let (router, _state, handles) = app::build(config).await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "opspulse listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("shutting down workers");
    handles.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
