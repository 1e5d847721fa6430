use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::consumer::{self, CapacityInlet};
use crate::engine::{Engine, LockPolicy};
use crate::limits::*;
use crate::model::Ms;
use crate::reaper;

/// Per-tenant knobs shared by every engine the manager creates.
#[derive(Debug, Clone, Copy)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub lock_policy: LockPolicy,
    pub dedup_retention_ms: Ms,
    pub event_queue: usize,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            lock_policy: LockPolicy::default(),
            dedup_retention_ms: 7 * 24 * 60 * 60 * 1000,
            event_queue: 1024,
        }
    }
}

/// One tenant's engine plus the inlet of its capacity event consumer.
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub events: CapacityInlet,
}

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// compactor, dedup reaper and capacity event consumer.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            settings,
        }
    }

    /// Get or lazily create the tenant with the given name. Names that
    /// sanitize to the same file stem share one tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Tenant>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if let Some(existing) = self.tenants.get(&safe_name) {
            return Ok(existing.value().clone());
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two connections may race to open the same tenant; only one engine
        // may own the WAL file.
        let entry = self.tenants.entry(safe_name.clone());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, self.settings.lock_policy)?);

        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            self.settings.compact_threshold,
        ));
        tokio::spawn(reaper::run_dedup_reaper(
            engine.clone(),
            self.settings.dedup_retention_ms,
        ));
        let events = consumer::spawn(engine.clone(), self.settings.event_queue);

        let created = Arc::new(Tenant { engine, events });
        entry.or_insert(created.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        tracing::info!("tenant {safe_name} opened");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("teesheet_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, TenantSettings::default());

        let a = tm.get_or_create("club_a").unwrap();
        let b = tm.get_or_create("club_b").unwrap();

        let rid = Ulid::new();
        // Same resource id in both tenants.
        a.engine.create_resource(rid, Some("A".into())).await.unwrap();
        b.engine.create_resource(rid, Some("B".into())).await.unwrap();

        let names_a: Vec<_> = a.engine.list_resources().await.into_iter().map(|r| r.name).collect();
        let names_b: Vec<_> = b.engine.list_resources().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names_a, vec![Some("A".to_string())]);
        assert_eq!(names_b, vec![Some("B".to_string())]);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), TenantSettings::default());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _tenant = tm.get_or_create("my_club").unwrap();
        assert!(dir.join("my_club.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, TenantSettings::default());

        let t1 = tm.get_or_create("foo").unwrap();
        let t2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&t1, &t2));
        assert!(Arc::ptr_eq(&t1.engine, &t2.engine));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), TenantSettings::default());

        // Path traversal attempt
        let _tenant = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        // Empty after sanitization
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_aliases_share_engine() {
        let dir = test_data_dir("aliases");
        let tm = TenantManager::new(dir.clone(), TenantSettings::default());

        // Both names map to cluba.wal; a second engine would double-own it.
        let dotted = tm.get_or_create("club.a").unwrap();
        let plain = tm.get_or_create("cluba").unwrap();
        assert!(Arc::ptr_eq(&dotted.engine, &plain.engine));

        let rid = Ulid::new();
        dotted.engine.create_resource(rid, None).await.unwrap();
        assert_eq!(plain.engine.list_resources().await.len(), 1);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, TenantSettings::default());

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_events_reach_engine() {
        let dir = test_data_dir("events");
        let tm = TenantManager::new(dir, TenantSettings::default());
        let tenant = tm.get_or_create("club").unwrap();

        let event = consumer::CapacityEvent {
            id: Ulid::new(),
            slot_id: Ulid::new(),
            delta: 1,
        };
        // Unknown slot: accepted by the queue, skipped by the consumer.
        tenant.events.submit(event).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(tenant.engine.list_dead_letters().is_empty());
    }
}
