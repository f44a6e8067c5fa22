//! Tombstone registry
//!
//! Durable deletion markers for project identities. A tombstone is written
//! once and never mutated; it keeps a deleted project from being recreated by
//! a device that still holds a pending creation for it.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::context::ContextHandle;
use crate::models::{ProjectKey, Tombstone};
use crate::storage::{get_json, put_json, scan_json, KvStore, Namespace, StorageResult};

const TOMBSTONE_PREFIX: &str = "tombstone:";

/// Tombstones for one namespace
pub struct TombstoneRegistry {
    kv: Arc<dyn KvStore>,
    namespace: Namespace,
}

impl TombstoneRegistry {
    pub fn new(kv: Arc<dyn KvStore>, context: &ContextHandle) -> Self {
        Self::for_namespace(kv, context.namespace.clone())
    }

    pub fn for_namespace(kv: Arc<dyn KvStore>, namespace: Namespace) -> Self {
        Self { kv, namespace }
    }

    /// Record a deletion
    ///
    /// If the key already has a tombstone, that entry is returned unchanged.
    pub fn create(&self, key: &ProjectKey) -> StorageResult<Tombstone> {
        if let Some(existing) = self.get(key)? {
            debug!(project = %key, "Tombstone already recorded");
            return Ok(existing);
        }

        let tombstone = Tombstone {
            key: key.clone(),
            deleted_at: Utc::now(),
        };
        put_json(self.kv.as_ref(), &self.namespace, &tombstone_key(key), &tombstone)?;
        info!(project = %key, "Recorded tombstone");
        Ok(tombstone)
    }

    pub fn exists(&self, key: &ProjectKey) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    pub fn get(&self, key: &ProjectKey) -> StorageResult<Option<Tombstone>> {
        get_json(self.kv.as_ref(), &self.namespace, &tombstone_key(key))
    }

    /// All tombstones, ordered by key
    pub fn list_all(&self) -> StorageResult<Vec<Tombstone>> {
        Ok(scan_json(self.kv.as_ref(), &self.namespace, TOMBSTONE_PREFIX)?
            .into_iter()
            .map(|(_, t)| t)
            .collect())
    }

    /// Prune a tombstone once its deletion has propagated
    pub fn remove(&self, key: &ProjectKey) -> StorageResult<()> {
        self.kv.delete(&self.namespace, &tombstone_key(key))
    }
}

fn tombstone_key(key: &ProjectKey) -> String {
    format!("{}{}", TOMBSTONE_PREFIX, key.storage_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;

    fn registry() -> TombstoneRegistry {
        TombstoneRegistry::for_namespace(Arc::new(MemoryKvStore::new()), Namespace::Local)
    }

    #[test]
    fn test_create_is_idempotent() {
        let registry = registry();
        let key = ProjectKey::new("alice", "novel").unwrap();

        let first = registry.create(&key).unwrap();
        let second = registry.create(&key).unwrap();

        assert_eq!(first, second);
        assert_eq!(registry.list_all().unwrap().len(), 1);
        assert!(registry.exists(&key).unwrap());
    }

    #[test]
    fn test_remove_and_list() {
        let registry = registry();
        let a = ProjectKey::new("alice", "a").unwrap();
        let b = ProjectKey::new("alice", "b").unwrap();
        registry.create(&b).unwrap();
        registry.create(&a).unwrap();

        let keys: Vec<_> = registry.list_all().unwrap().into_iter().map(|t| t.key).collect();
        assert_eq!(keys, vec![a.clone(), b.clone()]);

        registry.remove(&a).unwrap();
        assert!(!registry.exists(&a).unwrap());
        assert!(registry.exists(&b).unwrap());
    }
}
