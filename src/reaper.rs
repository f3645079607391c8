use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};
use crate::model::Ms;
use crate::observability::REAPED_TOTAL;

/// Fire the timeout or completion of every overdue reservation at `now`.
/// Returns how many were moved.
pub async fn reap_once(engine: &Engine, now: Ms) -> usize {
    let mut reaped = 0;
    for (id, seen, event) in engine.collect_overdue(now) {
        match engine.advance_if(id, seen, event).await {
            Ok(Some(to)) => {
                info!("reaped reservation {id}: {} -> {}", seen.as_str(), to.as_str());
                metrics::counter!(REAPED_TOTAL, "to" => to.as_str()).increment(1);
                reaped += 1;
            }
            // Moved by someone else since it was collected.
            Ok(None) => debug!("reaper skip {id}: no longer {}", seen.as_str()),
            Err(e) => warn!("reaper failed on {id}: {e}"),
        }
    }
    reaped
}

/// Background task that times out and completes overdue reservations.
pub async fn run_reaper(engine: Arc<Engine>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(engine.config().reap_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                reap_once(&engine, now_ms()).await;
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("reaper stopped");
}

/// Background task that compacts the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, shutdown: CancellationToken) {
    let threshold = engine.config().compact_threshold;
    let mut interval = tokio::time::interval(engine.config().reap_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if engine.wal_appends_since_compact().await < threshold {
                    continue;
                }
                if let Err(e) = engine.compact_wal().await {
                    warn!("journal compaction failed: {e}");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    debug!("compactor stopped");
}
