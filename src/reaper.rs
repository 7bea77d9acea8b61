use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};

/// Periodically moves notifications past their window to Expired.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.expire_notifications(now_ms()).await {
            Ok(0) => {}
            Ok(n) => info!(expired = n, "notification sweep"),
            Err(e) => warn!("notification sweep failed: {e}"),
        }
    }
}

/// Compacts the WAL once `threshold` appends have accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        debug!(appends, threshold, "compacting WAL");
        if let Err(e) = engine.compact_wal().await {
            warn!("WAL compaction failed: {e}");
        }
    }
}
