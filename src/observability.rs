use std::net::SocketAddr;

// ── RED metrics (run-driven) ────────────────────────────────────

/// Counter: recalculation runs. Labels: trigger, status.
pub const RECALC_RUNS_TOTAL: &str = "slotcalc_recalc_runs_total";

/// Histogram: recalculation latency in seconds, lock wait included. Labels: trigger.
pub const RECALC_DURATION_SECONDS: &str = "slotcalc_recalc_duration_seconds";

/// Counter: slot rows published by replaces.
pub const SLOTS_WRITTEN_TOTAL: &str = "slotcalc_slots_written_total";

/// Counter: staff calculated without external busy times after a load failure.
pub const BUSY_TIME_FAILURES_TOTAL: &str = "slotcalc_busy_time_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: slots currently published.
pub const PUBLISHED_SLOTS: &str = "slotcalc_published_slots";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotcalc_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotcalc_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
