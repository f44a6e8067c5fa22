//! Project media
//!
//! Media blobs (cover images, attachments) are stored as CBOR records so the
//! binary payload is kept as bytes rather than being base64-inflated as JSON.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::models::ProjectKey;
use crate::storage::{KvStore, Namespace, StorageError, StorageResult};

/// A stored media blob with its metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl MediaRecord {
    pub fn new(filename: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            filename: filename.into(),
            mime_type: mime_type.into(),
            data,
            created_at: Utc::now(),
        }
    }

    /// Encode the record as CBOR
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| StorageError::Encode {
            key: self.id.clone(),
            details: e.to_string(),
        })?;
        Ok(bytes)
    }

    /// Decode a record from CBOR
    pub fn decode(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }
}

/// Media records for projects in one namespace
pub struct MediaStore {
    kv: Arc<dyn KvStore>,
    namespace: Namespace,
}

impl MediaStore {
    pub fn new(kv: Arc<dyn KvStore>, namespace: Namespace) -> Self {
        Self { kv, namespace }
    }

    pub fn put(&self, project: &ProjectKey, record: &MediaRecord) -> StorageResult<()> {
        self.kv
            .put(&self.namespace, &media_key(project, &record.id), &record.encode()?)
    }

    /// Read a media record; an undecodable record reads as absent
    pub fn get(&self, project: &ProjectKey, media_id: &str) -> StorageResult<Option<MediaRecord>> {
        let Some(bytes) = self.kv.get(&self.namespace, &media_key(project, media_id))? else {
            return Ok(None);
        };
        match MediaRecord::decode(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(project = %project, media = media_id, error = %e, "Ignoring corrupt media record");
                Ok(None)
            }
        }
    }

    /// Every media record of a project
    pub fn list(&self, project: &ProjectKey) -> StorageResult<Vec<MediaRecord>> {
        let mut records = Vec::new();
        for (key, bytes) in self.kv.scan_prefix(&self.namespace, &media_prefix(project))? {
            match MediaRecord::decode(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %key, error = %e, "Ignoring corrupt media record"),
            }
        }
        Ok(records)
    }

    /// Ids of a project's media, without decoding the payloads
    pub fn ids(&self, project: &ProjectKey) -> StorageResult<Vec<String>> {
        let prefix = media_prefix(project);
        Ok(self
            .kv
            .scan_prefix(&self.namespace, &prefix)?
            .into_iter()
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect())
    }

    pub fn delete(&self, project: &ProjectKey, media_id: &str) -> StorageResult<()> {
        self.kv.delete(&self.namespace, &media_key(project, media_id))
    }

    pub fn delete_all(&self, project: &ProjectKey) -> StorageResult<usize> {
        self.kv.delete_prefix(&self.namespace, &media_prefix(project))
    }
}

fn media_prefix(project: &ProjectKey) -> String {
    format!("media:{}:", project.storage_id())
}

fn media_key(project: &ProjectKey, media_id: &str) -> String {
    format!("{}{}", media_prefix(project), media_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;

    fn store() -> (Arc<MemoryKvStore>, MediaStore) {
        let kv = Arc::new(MemoryKvStore::new());
        let store = MediaStore::new(kv.clone(), Namespace::Local);
        (kv, store)
    }

    #[test]
    fn test_put_get_list() {
        let (_, store) = store();
        let project = ProjectKey::new("alice", "novel").unwrap();
        let cover = MediaRecord::new("cover.png", "image/png", vec![0x89, 0x50, 0x4e, 0x47]);

        store.put(&project, &cover).unwrap();

        let loaded = store.get(&project, &cover.id).unwrap().unwrap();
        assert_eq!(loaded, cover);
        assert_eq!(store.list(&project).unwrap().len(), 1);
        assert_eq!(store.ids(&project).unwrap(), vec![cover.id.clone()]);
    }

    #[test]
    fn test_projects_do_not_share_media() {
        let (_, store) = store();
        let novel = ProjectKey::new("alice", "novel").unwrap();
        let sequel = ProjectKey::new("alice", "novel-2").unwrap();
        store
            .put(&novel, &MediaRecord::new("a.png", "image/png", vec![1]))
            .unwrap();
        store
            .put(&sequel, &MediaRecord::new("b.png", "image/png", vec![2]))
            .unwrap();

        assert_eq!(store.delete_all(&novel).unwrap(), 1);
        assert!(store.list(&novel).unwrap().is_empty());
        assert_eq!(store.list(&sequel).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_record_reads_as_absent() {
        let (kv, store) = store();
        let project = ProjectKey::new("alice", "novel").unwrap();
        kv.put(&Namespace::Local, "media:alice:novel:bad", b"\xff\x00junk")
            .unwrap();

        assert!(store.get(&project, "bad").unwrap().is_none());
        assert!(store.list(&project).unwrap().is_empty());
    }
}
