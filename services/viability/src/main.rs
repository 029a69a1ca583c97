use std::sync::Arc;

use anyhow::{Context, Result};
use viability::{ViabilityConfig, ViabilityService, observability::init_tracing, transport};

fn main() -> Result<()> {
    let config = ViabilityConfig::from_env().context("load viability config")?;
    init_tracing("viability");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.workers.max(1))
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: ViabilityConfig) -> Result<()> {
    let service = Arc::new(ViabilityService::from_config(&config)?);
    tracing::info!(
        data_dir = %config.data_dir.display(),
        codec = service.files.codec().name(),
        backend = service.backend.backend_name(),
        "viability service starting"
    );

    let migrated = service
        .roster
        .migrate_legacy()
        .await
        .context("migrate legacy roster")?;
    if migrated > 0 {
        tracing::warn!(rows = migrated, "roster entries without a password must be reset before they can log in");
    }

    let sweeper = auth::spawn_expiry_sweeper(Arc::clone(&service.sessions), config.session_sweep_interval);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    transport::serve(listener, service, shutdown_signal())
        .await
        .context("http server failed")?;

    sweeper.abort();
    tracing::info!("viability service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
