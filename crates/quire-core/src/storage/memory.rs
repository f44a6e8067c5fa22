//! In-memory record store
//!
//! Used by tests and by callers that want a throwaway workspace.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::error::{StorageError, StorageResult};
use super::kv::{KvStore, Namespace};

/// A `KvStore` backed by a sorted map
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all namespaces
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn records(&self) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.records.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, ns: &Namespace, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.records()?.get(&ns.compose(key)).cloned())
    }

    fn put(&self, ns: &Namespace, key: &str, value: &[u8]) -> StorageResult<()> {
        self.records()?.insert(ns.compose(key), value.to_vec());
        Ok(())
    }

    fn delete(&self, ns: &Namespace, key: &str) -> StorageResult<()> {
        self.records()?.remove(&ns.compose(key));
        Ok(())
    }

    fn scan_prefix(&self, ns: &Namespace, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let ns_prefix = ns.prefix();
        let full = ns.compose(prefix);
        let records = self.records()?;

        Ok(records
            .range(full.clone()..)
            .take_while(|(k, _)| k.starts_with(&full))
            .map(|(k, v)| (k[ns_prefix.len()..].to_string(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let kv = MemoryKvStore::new();
        let ns = Namespace::Local;

        assert!(kv.get(&ns, "a").unwrap().is_none());
        kv.put(&ns, "a", b"1").unwrap();
        assert_eq!(kv.get(&ns, "a").unwrap(), Some(b"1".to_vec()));

        kv.delete(&ns, "a").unwrap();
        assert!(kv.get(&ns, "a").unwrap().is_none());
        assert!(kv.is_empty());
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let kv = MemoryKvStore::new();
        let local = Namespace::Local;
        let server = Namespace::Server("12345678".to_string());

        kv.put(&local, "project:alice:novel", b"local").unwrap();
        kv.put(&server, "project:alice:novel", b"server").unwrap();

        assert_eq!(
            kv.get(&local, "project:alice:novel").unwrap(),
            Some(b"local".to_vec())
        );
        assert_eq!(
            kv.get(&server, "project:alice:novel").unwrap(),
            Some(b"server".to_vec())
        );
        assert_eq!(kv.scan_prefix(&local, "project:").unwrap().len(), 1);
    }

    #[test]
    fn test_scan_and_delete_prefix() {
        let kv = MemoryKvStore::new();
        let ns = Namespace::Local;

        kv.put(&ns, "media:alice:novel:1", b"a").unwrap();
        kv.put(&ns, "media:alice:novel:2", b"b").unwrap();
        kv.put(&ns, "media:alice:novel-2:1", b"c").unwrap();

        let scanned = kv.scan_prefix(&ns, "media:alice:novel:").unwrap();
        let keys: Vec<_> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["media:alice:novel:1", "media:alice:novel:2"]);

        assert_eq!(kv.delete_prefix(&ns, "media:alice:novel:").unwrap(), 2);
        assert_eq!(kv.len(), 1);
    }
}
