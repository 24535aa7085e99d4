use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;
use crate::lock::TtlLockMap;

/// Background task that periodically drops expired slot locks. Expired
/// entries are already takeable by `try_acquire`; the sweep keeps the map
/// from accumulating dead keys.
pub async fn run_lock_reaper(locks: Arc<TtlLockMap>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let reaped = locks.sweep_expired();
        if reaped > 0 {
            metrics::counter!(crate::observability::LOCKS_REAPED_TOTAL).increment(reaped as u64);
            info!("reaped {reaped} expired slot locks");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => debug!("compaction skipped: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{SlotKey, SlotLockRegistry};
    use chrono::NaiveDate;
    use ulid::Ulid;

    #[tokio::test]
    async fn sweep_counts_expired_locks() {
        let locks = Arc::new(TtlLockMap::new(Duration::from_millis(10)));
        let key = SlotKey {
            staff_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2030, 1, 7).unwrap(),
            start: 1000,
        };
        assert!(locks.try_acquire(key, Ulid::new()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.sweep_expired(), 1);
        assert!(locks.is_empty());
    }
}
