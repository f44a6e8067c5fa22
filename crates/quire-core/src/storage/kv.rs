//! Namespaced key/value storage
//!
//! Callers always address records as a `(Namespace, logical key)` pair. The
//! namespace prefix is only joined onto the key inside a `KvStore`
//! implementation, so an un-prefixed read cannot be written by accident.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::{StorageError, StorageResult};

/// Isolation domain for stored records
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "hash", rename_all = "lowercase")]
pub enum Namespace {
    /// Local-only mode (`local:`)
    Local,
    /// A remote server, identified by the short hash of its endpoint (`srv:{hash}:`)
    Server(String),
    /// Context registry records (`ctx:`)
    Registry,
    /// Records shared across contexts, keyed by owner and slug only
    Unscoped,
}

impl Namespace {
    /// The prefix joined onto logical keys at the storage boundary
    pub fn prefix(&self) -> String {
        match self {
            Namespace::Local => "local:".to_string(),
            Namespace::Server(hash) => format!("srv:{}:", hash),
            Namespace::Registry => "ctx:".to_string(),
            Namespace::Unscoped => String::new(),
        }
    }

    /// Join this namespace with a logical key
    pub fn compose(&self, key: &str) -> String {
        format!("{}{}", self.prefix(), key)
    }

    /// Whether this namespace belongs to a remote server
    pub fn is_server(&self) -> bool {
        matches!(self, Namespace::Server(_))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Unscoped => write!(f, "(unscoped)"),
            other => write!(f, "{}", other.prefix()),
        }
    }
}

/// A get/put/delete/scan record store
///
/// Keys returned from `scan_prefix` are logical keys with the namespace
/// prefix already removed, sorted ascending.
pub trait KvStore: Send + Sync {
    /// Read a record
    fn get(&self, ns: &Namespace, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Write a record, replacing any existing value
    fn put(&self, ns: &Namespace, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Remove a record (no-op if missing)
    fn delete(&self, ns: &Namespace, key: &str) -> StorageResult<()>;

    /// List all records whose logical key starts with `prefix`
    fn scan_prefix(&self, ns: &Namespace, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Remove all records whose logical key starts with `prefix`
    fn delete_prefix(&self, ns: &Namespace, prefix: &str) -> StorageResult<usize> {
        let records = self.scan_prefix(ns, prefix)?;
        for (key, _) in &records {
            self.delete(ns, key)?;
        }
        Ok(records.len())
    }
}

/// Read a JSON record
///
/// A record that no longer decodes is treated as absent: the user cannot
/// repair local storage by hand, so availability wins over alerting.
pub fn get_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    ns: &Namespace,
    key: &str,
) -> StorageResult<Option<T>> {
    let Some(bytes) = kv.get(ns, key)? else {
        return Ok(None);
    };

    match serde_json::from_slice(&bytes) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!(namespace = %ns, key, error = %e, "Ignoring corrupt stored record");
            Ok(None)
        }
    }
}

/// Write a JSON record
pub fn put_json<T: Serialize>(
    kv: &dyn KvStore,
    ns: &Namespace,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| StorageError::Encode {
        key: key.to_string(),
        details: e.to_string(),
    })?;
    kv.put(ns, key, &bytes)
}

/// Read every JSON record under a prefix, skipping corrupt ones
pub fn scan_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    ns: &Namespace,
    prefix: &str,
) -> StorageResult<Vec<(String, T)>> {
    let mut values = Vec::new();
    for (key, bytes) in kv.scan_prefix(ns, prefix)? {
        match serde_json::from_slice(&bytes) {
            Ok(value) => values.push((key, value)),
            Err(e) => {
                warn!(namespace = %ns, key = %key, error = %e, "Ignoring corrupt stored record");
            }
        }
    }
    Ok(values)
}
