use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Background task that rewrites the conference WAL once enough events have
/// been appended since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if compact_if_due(&engine, threshold).await {
            info!("compacted WAL");
        }
    }
}

/// One compactor step. Returns whether the WAL was rewritten.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return false;
    }
    debug!(appends, threshold, "WAL compaction due");
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();

        let rid = Ulid::new();
        engine
            .create_owner(rid, OwnerKind::Room, Some("Hall".into()), 0)
            .await
            .unwrap();
        assert!(!compact_if_due(&engine, 5).await);

        for _ in 0..3 {
            let id = Ulid::new();
            engine
                .add_availability(id, rid, Span::new(0, 1000))
                .await
                .unwrap();
            engine.remove_availability(id).await.unwrap();
        }
        assert!(compact_if_due(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Config, the room and an empty WIP schedule.
        let events = crate::wal::Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 3);
    }
}
