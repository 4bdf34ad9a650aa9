use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use slotcalc::config::Config;
use slotcalc::engine::{Recalculator, SystemClock};
use slotcalc::scheduler;
use slotcalc::source::InMemorySource;
use slotcalc::store::SlotStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    slotcalc::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let source = Arc::new(InMemorySource::load_json(&config.source_path)?);
    let store = Arc::new(SlotStore::open(&config.wal_path())?);
    let recalc = Arc::new(Recalculator::new(
        source,
        store.clone(),
        Arc::new(SystemClock),
        config.calc_settings(),
    ));

    info!("slotcalc started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  source: {}", config.source_path.display());
    info!("  timezone: {}", config.timezone);
    info!("  horizon: {} days, buffer: {} min", config.horizon_days, config.buffer_minutes);
    info!("  sweep every {}s", config.recalc_interval.as_secs());
    let metrics_url = config
        .metrics_port
        .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"));
    info!("  metrics: {metrics_url}");

    let sweeper = tokio::spawn(scheduler::run_scheduler(recalc, config.recalc_interval));
    let compactor = tokio::spawn(scheduler::run_compactor(store.clone(), config.compact_threshold));

    // Graceful shutdown on SIGTERM/ctrl-c
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
    info!("shutdown signal received, stopping background tasks");

    sweeper.abort();
    compactor.abort();
    let _ = sweeper.await;
    let _ = compactor.await;

    if let Err(e) = store.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }

    info!("slotcalc stopped");
    Ok(())
}
