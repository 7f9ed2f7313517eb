use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::compactor;
use crate::engine::{Engine, JsonFileRoster, WorkerRoster};
use crate::limits::*;

/// Builds the worker roster for a sanitized tenant name.
pub type RosterFactory = dyn Fn(&Path, &str) -> Arc<dyn WorkerRoster> + Send + Sync;

/// Manages per-tenant engines. Each tenant gets its own Engine, journal, roster and
/// compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    roster_factory: Box<RosterFactory>,
}

impl TenantManager {
    /// Tenants read their roster from `{tenant}.roster.json` in `data_dir`.
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self::with_roster_factory(data_dir, compact_threshold, |dir, tenant| {
            Arc::new(JsonFileRoster::new(dir.join(format!("{tenant}.roster.json"))))
        })
    }

    pub fn with_roster_factory(
        data_dir: PathBuf,
        compact_threshold: u64,
        factory: impl Fn(&Path, &str) -> Arc<dyn WorkerRoster> + Send + Sync + 'static,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            roster_factory: Box::new(factory),
        }
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let safe_name = sanitize(tenant);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to create the same tenant; the entry API keeps one.
        let entry = self.engines.entry(tenant.to_string());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let roster = (self.roster_factory)(&self.data_dir, &safe_name);
        let engine = Arc::new(Engine::new(wal_path, roster)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("tenant {safe_name} loaded");
        Ok(engine)
    }
}

/// Keep only characters safe in a file name.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StaticRoster;
    use crate::model::Worker;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_roster(dir: &Path, tenant: &str, workers: &[Worker]) {
        let json = serde_json::to_vec(workers).unwrap();
        fs::write(dir.join(format!("{tenant}.roster.json")), json).unwrap();
    }

    fn worker(first: &str) -> Worker {
        Worker {
            id: Ulid::new(),
            first_name: first.into(),
            last_name: "Tester".into(),
        }
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        write_roster(&dir, "tenant_a", &[worker("Ada"), worker("Alan")]);
        let tm = TenantManager::new(dir, 1000);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        eng_a.generate_slots(2025, Some(3)).await.unwrap();

        let slots_a = eng_a
            .list_slots("2025-03-10 00:00", "2025-03-11 00:00")
            .await
            .unwrap();
        assert_eq!(slots_a.len(), 8);
        assert_eq!(slots_a[0].remaining(), Some(2));

        let slots_b = eng_b
            .list_slots("2025-03-10 00:00", "2025-03-11 00:00")
            .await
            .unwrap();
        assert!(slots_b.is_empty());
        assert!(eng_b.workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
        assert_eq!(tm.tenant_count(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn custom_roster_factory_is_used() {
        let dir = test_data_dir("factory");
        let shared = Arc::new(StaticRoster::new(vec![worker("Grace")]));
        let roster = shared.clone();
        let tm = TenantManager::with_roster_factory(dir, 1000, move |_, _| roster.clone());

        let engine = tm.get_or_create("clinic").unwrap();
        assert_eq!(engine.workers().await.unwrap().len(), 1);

        shared.replace(vec![worker("Grace"), worker("Edsger")]).await;
        assert_eq!(engine.workers().await.unwrap().len(), 2);
    }

    #[test]
    fn sanitize_strips_path_characters() {
        assert_eq!(sanitize("a/b\\c.d"), "abcd");
        assert_eq!(sanitize("clinic-01_x"), "clinic-01_x");
    }
}
