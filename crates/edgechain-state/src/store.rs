//! StateStore: redb-backed observed state.
//!
//! Typed CRUD over resources, outputs, and target health. Supports on-disk
//! and in-memory backends (the latter for tests and dry runs).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.open_table(OUTPUTS).map_err(map_err!(Table))?;
        txn.open_table(TARGET_HEALTH).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    fn remove_prefix(&self, table: Table, prefix: &str) -> StateResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let t = txn.open_table(table).map_err(map_err!(Table))?;
            t.iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(prefix).then_some(k)
                })
                .collect()
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            for key in &keys {
                t.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(keys.len() as u32)
    }

    // ── Resources ──────────────────────────────────────────────────

    pub fn put_resource(&self, record: &ResourceRecord) -> StateResult<()> {
        let key = record.table_key();
        self.put(RESOURCES, &key, record)?;
        debug!(%key, physical_id = %record.physical_id, "resource recorded");
        Ok(())
    }

    pub fn get_resource(&self, env: &str, key: &ResourceKey) -> StateResult<Option<ResourceRecord>> {
        self.get(RESOURCES, &resource_key(env, key))
    }

    /// All resources of an environment, in creation order.
    pub fn list_resources(&self, env: &str) -> StateResult<Vec<ResourceRecord>> {
        let mut records: Vec<ResourceRecord> = self.scan(RESOURCES, &format!("{env}/"))?;
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    pub fn delete_resource(&self, env: &str, key: &ResourceKey) -> StateResult<bool> {
        let existed = self.remove(RESOURCES, &resource_key(env, key))?;
        debug!(%env, %key, existed, "resource deleted");
        Ok(existed)
    }

    /// Next free creation sequence number for an environment.
    pub fn next_sequence(&self, env: &str) -> StateResult<u64> {
        Ok(self
            .list_resources(env)?
            .last()
            .map(|r| r.sequence + 1)
            .unwrap_or(0))
    }

    /// Environments that have at least one recorded resource.
    pub fn list_environments(&self) -> StateResult<Vec<EnvId>> {
        let mut envs: Vec<EnvId> = self
            .scan::<ResourceRecord>(RESOURCES, "")?
            .into_iter()
            .map(|r| r.env)
            .collect();
        envs.sort();
        envs.dedup();
        Ok(envs)
    }

    // ── Outputs ────────────────────────────────────────────────────

    pub fn put_output(&self, output: &OutputRecord) -> StateResult<()> {
        self.put(OUTPUTS, &output.table_key(), output)
    }

    pub fn list_outputs(&self, env: &str) -> StateResult<Vec<OutputRecord>> {
        self.scan(OUTPUTS, &format!("{env}/"))
    }

    pub fn clear_outputs(&self, env: &str) -> StateResult<u32> {
        self.remove_prefix(OUTPUTS, &format!("{env}/"))
    }

    // ── Target health ──────────────────────────────────────────────

    pub fn put_target_health(&self, record: &TargetHealthRecord) -> StateResult<()> {
        self.put(TARGET_HEALTH, &record.table_key(), record)
    }

    pub fn list_target_health(
        &self,
        env: &str,
        target_group: &str,
    ) -> StateResult<Vec<TargetHealthRecord>> {
        self.scan(TARGET_HEALTH, &format!("{env}/{target_group}/"))
    }

    pub fn clear_target_health(&self, env: &str) -> StateResult<u32> {
        self.remove_prefix(TARGET_HEALTH, &format!("{env}/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn record(env: &str, kind: ResourceKind, name: &str, sequence: u64) -> ResourceRecord {
        ResourceRecord {
            env: env.to_string(),
            key: ResourceKey::new(kind, name),
            physical_id: format!("{kind}-{name}"),
            fingerprint: "abc".to_string(),
            attributes: serde_json::json!({ "name": name }),
            sequence,
            run_id: "run-1".to_string(),
            created_at: 1000,
        }
    }

    #[test]
    fn resource_put_and_get() {
        let s = store();
        let r = record("prod", ResourceKind::Fabric, "vpc", 0);
        s.put_resource(&r).unwrap();

        let got = s.get_resource("prod", &r.key).unwrap().unwrap();
        assert_eq!(got, r);
        assert!(s.get_resource("staging", &r.key).unwrap().is_none());
    }

    #[test]
    fn resources_listed_in_sequence_order() {
        let s = store();
        s.put_resource(&record("prod", ResourceKind::Listener, "https", 2)).unwrap();
        s.put_resource(&record("prod", ResourceKind::Fabric, "vpc", 0)).unwrap();
        s.put_resource(&record("prod", ResourceKind::Cluster, "app", 1)).unwrap();

        let names: Vec<_> = s
            .list_resources("prod")
            .unwrap()
            .into_iter()
            .map(|r| r.key.name)
            .collect();
        assert_eq!(names, vec!["vpc", "app", "https"]);
        assert_eq!(s.next_sequence("prod").unwrap(), 3);
        assert_eq!(s.next_sequence("empty").unwrap(), 0);
    }

    #[test]
    fn environments_are_isolated() {
        let s = store();
        s.put_resource(&record("prod", ResourceKind::Fabric, "vpc", 0)).unwrap();
        s.put_resource(&record("prod-eu", ResourceKind::Fabric, "vpc", 0)).unwrap();

        assert_eq!(s.list_resources("prod").unwrap().len(), 1);
        assert_eq!(s.list_environments().unwrap(), vec!["prod", "prod-eu"]);
    }

    #[test]
    fn resource_delete() {
        let s = store();
        let r = record("prod", ResourceKind::Fabric, "vpc", 0);
        s.put_resource(&r).unwrap();
        assert!(s.delete_resource("prod", &r.key).unwrap());
        assert!(!s.delete_resource("prod", &r.key).unwrap());
    }

    #[test]
    fn outputs_put_list_clear() {
        let s = store();
        for (k, v) in [("image-uri", "app:1"), ("external-port", "443")] {
            s.put_output(&OutputRecord {
                env: "prod".to_string(),
                key: k.to_string(),
                value: v.to_string(),
            })
            .unwrap();
        }
        assert_eq!(s.list_outputs("prod").unwrap().len(), 2);
        assert_eq!(s.clear_outputs("prod").unwrap(), 2);
        assert!(s.list_outputs("prod").unwrap().is_empty());
    }

    #[test]
    fn target_health_scoped_by_group() {
        let s = store();
        let rec = |tg: &str, target: &str| TargetHealthRecord {
            env: "prod".to_string(),
            target_group: tg.to_string(),
            target: target.to_string(),
            state: TargetHealthState::Healthy,
            reason: None,
            updated_at: 1,
        };
        s.put_target_health(&rec("app-tg", "10.0.2.10:3000")).unwrap();
        s.put_target_health(&rec("app-tg", "10.0.3.10:3000")).unwrap();
        s.put_target_health(&rec("edge-tg", "listener-1")).unwrap();

        assert_eq!(s.list_target_health("prod", "app-tg").unwrap().len(), 2);
        assert_eq!(s.clear_target_health("prod").unwrap(), 3);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let s = StateStore::open(&path).unwrap();
            s.put_resource(&record("prod", ResourceKind::Fabric, "vpc", 0)).unwrap();
        }
        let s = StateStore::open(&path).unwrap();
        assert_eq!(s.list_resources("prod").unwrap().len(), 1);
    }
}
