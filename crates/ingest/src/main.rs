use std::sync::Arc;

use anyhow::Context;

use tally_ingest::{IngestConfig, IngestService, app::build_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tally_observability::init();

    let config = IngestConfig::from_env()?;
    if config.token.is_none() {
        tracing::warn!("TALLY_INGEST_TOKEN not set; sync endpoints are unauthenticated");
    }

    let app = build_app(Arc::new(IngestService::new()), config.token);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    Ok(())
}
