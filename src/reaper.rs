use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::arbiter::InMemoryArbiter;
use crate::model::now_ms;
use crate::store::SlotStore;

/// Background task that periodically sweeps expired provisional holds, so a
/// client that died mid-attempt cannot strand capacity.
pub async fn run_hold_reaper(arbiter: Arc<InMemoryArbiter>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let swept = arbiter.purge_expired(now_ms());
        if swept > 0 {
            metrics::counter!(crate::observability::HOLDS_EXPIRED_TOTAL)
                .increment(swept as u64);
            info!("reaped {swept} expired holds");
        }
    }
}

/// Background task that rewrites the WAL once enough appends accumulate.
pub async fn run_compactor(store: Arc<SlotStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_log().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ReservationArbiter;
    use ulid::Ulid;

    #[tokio::test]
    async fn expired_holds_are_swept() {
        let arbiter = InMemoryArbiter::new(Duration::from_millis(10));
        let slot = Ulid::new();
        arbiter.hold(slot).await.unwrap();
        assert_eq!(arbiter.hold_count(slot), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let swept = arbiter.purge_expired(now_ms());
        assert_eq!(swept, 1);
        assert_eq!(arbiter.hold_count(slot), 0);
    }

    #[tokio::test]
    async fn live_holds_survive_a_sweep() {
        let arbiter = InMemoryArbiter::new(Duration::from_secs(300));
        let slot = Ulid::new();
        arbiter.hold(slot).await.unwrap();

        assert_eq!(arbiter.purge_expired(now_ms()), 0);
        assert_eq!(arbiter.hold_count(slot), 1);
    }
}
