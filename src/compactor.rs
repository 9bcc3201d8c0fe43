use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::observability;
use crate::service::BookingService;
use crate::store::BookingStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once `threshold` appends have
/// accumulated since the last compaction.
pub async fn run_compactor(service: Arc<BookingService>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(service.store(), threshold).await;
    }
}

/// Returns the number of live bookings written, if a compaction ran.
pub async fn compact_if_needed(store: &BookingStore, threshold: u64) -> Option<usize> {
    let appends = store.wal_appends_since_compact().await;
    if threshold == 0 || appends < threshold {
        return None;
    }
    match store.compact_wal().await {
        Ok(live) => {
            metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            info!("compacted WAL: {appends} appends down to {live} bookings");
            Some(live)
        }
        Err(e) => {
            metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => "error")
                .increment(1);
            error!("WAL compaction failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::model::fixtures::requester;
    use crate::model::*;
    use crate::store::StoreConfig;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("interlock_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let store = BookingStore::open(
            StoreConfig::new(test_wal_path("threshold.wal")),
            Arc::new(StaticCatalog::campus_defaults()),
        )
        .unwrap();
        let lab = ResourceId::new("fcs-lab-1");

        for i in 0..3 {
            let b = store
                .try_commit(
                    &lab,
                    Span::new(i * 1000, i * 1000 + 500),
                    BookingPayload {
                        requester: requester("Asha"),
                        reason: None,
                    },
                )
                .await
                .unwrap();
            if i > 0 {
                store.cancel_booking(b.id).await.unwrap();
            }
        }
        // 3 commits + 2 cancels
        assert_eq!(compact_if_needed(&store, 6).await, None);
        assert_eq!(compact_if_needed(&store, 0).await, None);
        assert_eq!(compact_if_needed(&store, 5).await, Some(1));
        assert_eq!(store.wal_appends_since_compact().await, 0);
        assert_eq!(compact_if_needed(&store, 5).await, None);
    }
}
