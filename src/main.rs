use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use labsched::config::{CatalogSeed, EngineConfig};
use labsched::engine::Engine;
use labsched::notify::NotifyHub;
use labsched::reaper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("LABSCHED_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    labsched::observability::init(metrics_port)?;

    let data_dir = std::env::var("LABSCHED_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let catalog_path = std::env::var("LABSCHED_CATALOG").ok();
    let config = EngineConfig::from_env();

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("labsched.wal");
    let engine = Arc::new(Engine::new(wal_path, config, Arc::new(NotifyHub::new()))?);

    if let Some(path) = catalog_path {
        let seed = CatalogSeed::load(Path::new(&path))?;
        let added = engine.seed_catalog(seed).await?;
        info!("seeded {added} catalog entries from {path}");
    }

    let cfg = engine.config();
    info!("labsched started");
    info!("  data_dir: {data_dir}");
    info!("  ranking: {}", engine.ranking().name());
    info!("  lock_timeout: {:?}", cfg.lock_timeout);
    info!("  readiness_timeout: {:?}", cfg.readiness_timeout);
    info!("  block size: {}..={}", cfg.block_min, cfg.block_max);
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let shutdown = CancellationToken::new();
    let reaper_task = tokio::spawn(reaper::run_reaper(engine.clone(), shutdown.clone()));
    let compactor_task = tokio::spawn(reaper::run_compactor(engine.clone(), shutdown.clone()));

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received, stopping background tasks");
    shutdown.cancel();
    let _ = tokio::join!(reaper_task, compactor_task);

    info!("labsched stopped with {} reservations", engine.reservation_count());
    Ok(())
}
