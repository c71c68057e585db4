use std::sync::Arc;

use tracing::info;

use torque::config::Config;
use torque::engine::Engine;
use torque::maintenance;
use torque::notify::NotifyHub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    torque::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let journal = config.journal_path();
    let engine = Arc::new(Engine::open(journal.clone(), Arc::new(NotifyHub::new())).await?);

    let counts = engine.entity_counts();
    info!("torque started");
    info!("  journal: {}", journal.display());
    info!(
        "  loaded: {} resources, {} parts, {} work orders",
        counts.resources, counts.parts, counts.work_orders
    );
    info!(
        "  compaction: every {} appends, checked every {:?}",
        config.compact_threshold, config.compact_interval
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let compactor = tokio::spawn(maintenance::run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));

    shutdown_signal().await?;
    info!("shutdown signal received");
    compactor.abort();
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("torque stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
