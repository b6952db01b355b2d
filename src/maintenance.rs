use std::sync::Arc;

use chrono::Days;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::model::local_day;
use crate::observability::{DAY_LOCKS_TRACKED, WAL_COMPACTIONS_TOTAL};
use crate::tenant::TenantManager;

/// Compact `engine`'s WAL once it has taken `threshold` appends since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await?;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
    Ok(true)
}

/// Drop unheld day locks older than `retention_days` before the business's
/// current local day. Returns how many were removed.
pub fn prune_day_locks(engine: &Engine, now: i64, retention_days: u32) -> usize {
    let offset = engine.settings().map(|s| s.utc_offset_min).unwrap_or(0);
    let today = local_day(now, offset);
    let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(retention_days))) else {
        return 0;
    };
    engine.day_locks().prune(cutoff)
}

/// One maintenance pass over every tenant.
pub async fn run_once(manager: &TenantManager, config: &Config, now: i64) {
    let mut tracked = 0usize;
    for engine in manager.engines() {
        match compact_if_needed(&engine, config.compact_threshold).await {
            Ok(true) => debug!(business_id = %engine.business_id, "WAL compacted"),
            Ok(false) => {}
            Err(e) => warn!(business_id = %engine.business_id, "compaction failed: {e}"),
        }
        let pruned = prune_day_locks(&engine, now, config.day_lock_retention_days);
        if pruned > 0 {
            info!(business_id = %engine.business_id, pruned, "pruned day locks");
        }
        tracked += engine.day_locks().len();
    }
    metrics::gauge!(DAY_LOCKS_TRACKED).set(tracked as f64);
}

/// Background loop: a pass every `config.maintenance_interval`.
pub async fn run_maintenance(manager: Arc<TenantManager>, config: Config, clock: Arc<dyn crate::clock::Clock>) {
    let mut interval = tokio::time::interval(config.maintenance_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        run_once(&manager, &config, clock.now_ms()).await;
    }
}
