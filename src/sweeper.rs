use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::store::MemoryStore;

/// Background task that periodically deletes expired holds until `shutdown`
/// fires. Holds are also ignored lazily by every read, so a late or failed
/// sweep never lets an expired hold block anyone.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        match engine.sweep_expired_holds(now_ms()).await {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "swept expired holds"),
            Err(e) => warn!("hold sweep failed: {e}"),
        }
    }
    debug!("sweeper stopped");
}

/// Rewrite the WAL once it has grown by `threshold` appends since the last
/// compaction.
pub async fn run_compactor(
    store: Arc<MemoryStore>,
    threshold: u64,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = store.compact().await {
            warn!(appends, "compaction failed: {e}");
        }
    }
    debug!("compactor stopped");
}
