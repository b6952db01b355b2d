use std::sync::Arc;

use tracing::info;

use agenda::clock::{Clock, SystemClock};
use agenda::config::Config;
use agenda::maintenance;
use agenda::tenant::TenantManager;

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    agenda::observability::init(config.metrics_port)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let manager = Arc::new(TenantManager::open(&config, clock.clone())?);

    info!("agenda started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  tenants: {}", manager.len());
    info!("  lock_timeout: {:?}", config.lock_timeout);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );
    for engine in manager.engines() {
        let stats = engine.stats();
        info!(
            business_id = %engine.business_id,
            appointments = stats.appointments,
            links = stats.links,
            transactions = stats.transactions,
            "tenant ready"
        );
    }

    let maintenance = tokio::spawn(maintenance::run_maintenance(
        manager.clone(),
        config.clone(),
        clock.clone(),
    ));

    shutdown_signal().await;
    info!("shutdown signal received, stopping maintenance");
    maintenance.abort();

    // Leave every WAL compacted so the next start replays quickly.
    for engine in manager.engines() {
        if let Err(e) = engine.compact_wal().await {
            tracing::warn!(business_id = %engine.business_id, "final compaction failed: {e}");
        }
    }

    info!("agenda stopped");
    Ok(())
}
