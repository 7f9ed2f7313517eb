use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites a tenant's journal once enough commits accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// Compact when at least `threshold` commits landed since the last rewrite.
/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends since last compaction, below {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StaticRoster;
    use crate::model::Worker;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn roster() -> Arc<StaticRoster> {
        Arc::new(StaticRoster::new(vec![Worker {
            id: Ulid::new(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
        }]))
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), roster()).unwrap();

        engine.generate_slots(2025, Some(3)).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 1);

        assert!(!compact_if_due(&engine, 5).await);
        assert!(compact_if_due(&engine, 1).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Compacted journal replays to the same slots.
        let before = engine
            .list_slots("2025-03-01 00:00", "2025-04-01 00:00")
            .await
            .unwrap();
        drop(engine);
        let reopened = Engine::new(path, roster()).unwrap();
        let after = reopened
            .list_slots("2025-03-01 00:00", "2025-04-01 00:00")
            .await
            .unwrap();
        assert_eq!(before, after);
    }
}
