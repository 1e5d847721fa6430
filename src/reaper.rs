use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::{now_ms, Engine, EngineError};
use crate::model::Ms;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEDUP_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&engine, threshold).await {
            error!("WAL compaction failed: {e}");
        }
    }
}

pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    debug!("{appends} appends since last compaction, compacting");
    engine.compact_wal().await?;
    Ok(true)
}

/// Background task that forgets processed capacity event ids once they fall
/// out of the retention window.
pub async fn run_dedup_reaper(engine: Arc<Engine>, retention_ms: Ms) {
    let mut interval = tokio::time::interval(DEDUP_REAP_INTERVAL);
    loop {
        interval.tick().await;
        match engine.prune_processed(now_ms() - retention_ms).await {
            Ok(0) => {}
            Ok(n) => info!("forgot {n} processed capacity event ids"),
            Err(e) => error!("dedup reaper failed: {e}"),
        }
    }
}
