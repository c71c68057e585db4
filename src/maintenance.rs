use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;

/// Compact the journal once it has grown by `threshold` appends.
/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted journal after {appends} appends");
            true
        }
        Err(e) => {
            warn!("journal compaction failed: {e}");
            false
        }
    }
}

/// Background task that checks the journal size every `every`.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
        engine.notify.prune();
    }
}
