use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::Recalculator;
use crate::store::SlotStore;

/// Result of one pass over every tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub tenants: usize,
    pub failed: usize,
    pub written: usize,
    /// Slots dropped because they had already ended.
    pub pruned: usize,
}

/// Prune slots that have ended, then recalculate every tenant the source knows
/// about over the default horizon. A failing tenant is logged and skipped; the
/// others still run.
pub async fn sweep_all_tenants(recalc: &Recalculator) -> SweepSummary {
    let pruned = match recalc.prune_expired().await {
        Ok(n) => n,
        Err(e) => {
            error!("sweep: pruning expired slots failed: {e}");
            0
        }
    };
    let tenants = match recalc.source().tenants().await {
        Ok(t) => t,
        Err(e) => {
            error!("sweep: cannot list tenants: {e}");
            return SweepSummary {
                pruned,
                ..Default::default()
            };
        }
    };

    let mut summary = SweepSummary {
        tenants: tenants.len(),
        pruned,
        ..Default::default()
    };
    for tenant in &tenants {
        match recalc.recalculate_for_tenant(tenant, None).await {
            Ok(report) => summary.written += report.written,
            Err(e) => {
                summary.failed += 1;
                error!(tenant = %tenant, "sweep: recalculation failed: {e}");
            }
        }
    }
    summary
}

/// Background task that sweeps all tenants every `period`, starting immediately.
pub async fn run_scheduler(recalc: Arc<Recalculator>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let summary = sweep_all_tenants(&recalc).await;
        info!(
            tenants = summary.tenants,
            failed = summary.failed,
            written = summary.written,
            pruned = summary.pruned,
            "scheduled sweep finished"
        );
    }
}

/// Compact the WAL once it has grown past `threshold` appends.
pub async fn compact_if_needed(store: &SlotStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => {
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that checks the WAL size every 30 seconds.
pub async fn run_compactor(store: Arc<SlotStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}
