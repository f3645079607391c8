use std::net::SocketAddr;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: allocation attempts. Labels: outcome (granted, no_availability, or an error kind).
pub const ALLOCATIONS_TOTAL: &str = "labsched_allocations_total";

/// Histogram: end-to-end `create` latency in seconds.
pub const ALLOCATION_DURATION_SECONDS: &str = "labsched_allocation_duration_seconds";

/// Histogram: free candidates found per resolution.
pub const RESOLVE_CANDIDATES: &str = "labsched_resolve_candidates";

/// Counter: reservation state transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "labsched_transitions_total";

// ── Contention metrics ──────────────────────────────────────────

/// Histogram: time to take all allocation locks, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "labsched_lock_wait_seconds";

/// Counter: lock acquisitions that hit the bound.
pub const LOCK_TIMEOUTS_TOTAL: &str = "labsched_lock_timeouts_total";

/// Counter: reservations reaped by the background task. Labels: to.
pub const REAPED_TOTAL: &str = "labsched_reaped_total";

// ── Journal metrics ─────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "labsched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "labsched_wal_flush_batch_size";

/// Gauge: live (non-terminal) reservations.
pub const RESERVATIONS_LIVE: &str = "labsched_reservations_live";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
