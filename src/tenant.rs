use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::Engine;
use crate::limits::*;
use crate::compactor;
use crate::notify::NotifyHub;

/// One engine per conference. The conference is the database name of the
/// pgwire connection; each gets its own WAL file and compactor task.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Engine of the given conference, replayed from its WAL on first use.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        // Only [A-Za-z0-9_-] reach the file system.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // The shard stays locked during replay; racing callers get this engine.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!(conference = %safe_name, "conference loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use tokio_test::assert_ok;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn conferences_are_isolated() {
        let tm = TenantManager::new(test_data_dir("isolation"), 1000);
        let a = tm.get_or_create("conf_a").unwrap();
        let b = tm.get_or_create("conf_b").unwrap();

        let rid = Ulid::new();
        a.create_owner(rid, OwnerKind::Room, Some("Hall".into()), 0)
            .await
            .unwrap();
        b.create_owner(rid, OwnerKind::Room, Some("Aula".into()), 0)
            .await
            .unwrap();
        a.add_availability(Ulid::new(), rid, Span::new(0, 10_000))
            .await
            .unwrap();
        a.freeze("v1", None, false).await.unwrap();

        assert!(b.compute_availability(rid, 0, 10_000, None).await.unwrap().is_empty());
        assert_eq!(
            a.compute_availability(rid, 0, 10_000, None).await.unwrap(),
            vec![Span::new(0, 10_000)]
        );
        assert_eq!(b.list_schedules().await.len(), 1);
    }

    #[tokio::test]
    async fn conference_created_lazily() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _engine = tm.get_or_create("pycon").unwrap();
        assert!(dir.join("pycon.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let tm = TenantManager::new(test_data_dir("same_engine"), 1000);
        let first = assert_ok!(tm.get_or_create("foo"));
        let second = assert_ok!(tm.get_or_create("foo"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_first_connections_share_one_engine() {
        let tm = Arc::new(TenantManager::new(test_data_dir("race"), 1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tm = tm.clone();
                tokio::spawn(async move { tm.get_or_create("busy").unwrap() })
            })
            .collect();

        let mut engines = Vec::new();
        for h in handles {
            engines.push(h.await.unwrap());
        }
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
        assert_eq!(tm.engines.len(), 1);
    }

    #[tokio::test]
    async fn conference_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let evil = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(Arc::ptr_eq(&evil, &tm.get_or_create("evil").unwrap()));
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn conference_limits() {
        let tm = TenantManager::new(test_data_dir("limits"), 1000);
        let err = tm
            .get_or_create(&"x".repeat(MAX_TENANT_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("tenant name too long"));

        for i in 0..MAX_TENANTS {
            assert_ok!(tm.get_or_create(&format!("c{i}")));
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
