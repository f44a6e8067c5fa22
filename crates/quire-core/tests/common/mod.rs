//! Shared fixtures for quire-core integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use quire_core::media::MediaRecord;
use quire_core::models::{MetadataPatch, ProjectDraft, ProjectKey, Tombstone};
use quire_core::remote::{CreateProjectRequest, RemoteError, RemoteProject, RemoteProjectApi};
use quire_core::storage::{StorageError, StorageResult};
use quire_core::{ContextHandle, KvStore, MemoryKvStore, Namespace, Workspace};

pub const ENDPOINT: &str = "https://quire.example.com";

/// In-memory stand-in for the server's project API
///
/// Behaviour is scripted per slug: a slug can be made to fail, to conflict
/// with an existing project, or to be re-keyed by the server.
#[derive(Default)]
pub struct ScriptedRemote {
    projects: Mutex<BTreeMap<ProjectKey, RemoteProject>>,
    tombstones: Mutex<BTreeSet<ProjectKey>>,
    failing: Mutex<BTreeSet<String>>,
    renames: Mutex<BTreeMap<String, String>>,
    create_calls: Mutex<Vec<ProjectKey>>,
    updates: Mutex<Vec<(ProjectKey, MetadataPatch)>>,
    uploads: Mutex<Vec<(ProjectKey, String)>>,
    tombstone_check_down: Mutex<bool>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every request touching `slug` fails with a 503
    pub fn fail_slug(&self, slug: &str) {
        self.failing.lock().unwrap().insert(slug.to_string());
    }

    pub fn heal_slug(&self, slug: &str) {
        self.failing.lock().unwrap().remove(slug);
    }

    /// The server assigns `to` when asked to create `from`
    pub fn rename_slug(&self, from: &str, to: &str) {
        self.renames
            .lock()
            .unwrap()
            .insert(from.to_string(), to.to_string());
    }

    /// Seed a project that already exists on the server
    pub fn seed_project(&self, key: &ProjectKey, title: &str) {
        self.projects
            .lock()
            .unwrap()
            .insert(key.clone(), project(key, title));
    }

    /// Record a deletion made from another device
    pub fn tombstone(&self, key: &ProjectKey) {
        self.projects.lock().unwrap().remove(key);
        self.tombstones.lock().unwrap().insert(key.clone());
    }

    /// Make the tombstone endpoint fail (or recover)
    pub fn set_tombstone_check_down(&self, down: bool) {
        *self.tombstone_check_down.lock().unwrap() = down;
    }

    pub fn project(&self, key: &ProjectKey) -> Option<RemoteProject> {
        self.projects.lock().unwrap().get(key).cloned()
    }

    pub fn project_count(&self) -> usize {
        self.projects.lock().unwrap().len()
    }

    pub fn create_calls(&self) -> Vec<ProjectKey> {
        self.create_calls.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<(ProjectKey, MetadataPatch)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(ProjectKey, String)> {
        self.uploads.lock().unwrap().clone()
    }

    fn check_failing(&self, slug: &str) -> Result<(), RemoteError> {
        if self.failing.lock().unwrap().contains(slug) {
            return Err(RemoteError::Status {
                code: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn project(key: &ProjectKey, title: &str) -> RemoteProject {
    RemoteProject {
        id: format!("srv-{}-{}", key.owner, key.slug),
        owner: key.owner.clone(),
        slug: key.slug.clone(),
        title: title.to_string(),
        description: None,
        cover_media_id: None,
        updated_at: Some(Utc::now()),
    }
}

#[async_trait]
impl RemoteProjectApi for ScriptedRemote {
    async fn create_project(
        &self,
        owner: &str,
        request: &CreateProjectRequest,
    ) -> Result<RemoteProject, RemoteError> {
        self.check_failing(&request.slug)?;
        let slug = self
            .renames
            .lock()
            .unwrap()
            .get(&request.slug)
            .cloned()
            .unwrap_or_else(|| request.slug.clone());
        let key = ProjectKey::new(owner, slug).map_err(|e| RemoteError::Status {
            code: 400,
            body: e.to_string(),
        })?;
        self.create_calls.lock().unwrap().push(key.clone());

        let mut projects = self.projects.lock().unwrap();
        if let Some(existing) = projects.get(&key) {
            return Err(RemoteError::Conflict {
                existing: Some(existing.clone()),
            });
        }
        let mut created = project(&key, &request.title);
        created.description = request.description.clone();
        projects.insert(key, created.clone());
        Ok(created)
    }

    async fn get_project(&self, key: &ProjectKey) -> Result<RemoteProject, RemoteError> {
        self.check_failing(&key.slug)?;
        self.project(key).ok_or(RemoteError::NotFound)
    }

    async fn update_project(
        &self,
        key: &ProjectKey,
        patch: &MetadataPatch,
    ) -> Result<RemoteProject, RemoteError> {
        self.check_failing(&key.slug)?;
        self.updates
            .lock()
            .unwrap()
            .push((key.clone(), patch.clone()));

        let mut projects = self.projects.lock().unwrap();
        let current = projects.get_mut(key).ok_or(RemoteError::NotFound)?;
        if let Some(ref title) = patch.title {
            current.title = title.clone();
        }
        if let Some(ref description) = patch.description {
            current.description = Some(description.clone());
        }
        if let Some(ref cover) = patch.cover_media_id {
            current.cover_media_id = Some(cover.clone());
        }
        Ok(current.clone())
    }

    async fn check_tombstones(&self, keys: &[ProjectKey]) -> Result<Vec<Tombstone>, RemoteError> {
        if *self.tombstone_check_down.lock().unwrap() {
            return Err(RemoteError::Network("connection reset".to_string()));
        }
        let tombstones = self.tombstones.lock().unwrap();
        Ok(keys
            .iter()
            .filter(|k| tombstones.contains(k))
            .map(|k| Tombstone {
                key: k.clone(),
                deleted_at: Utc::now(),
            })
            .collect())
    }

    async fn upload_media(&self, key: &ProjectKey, media: &MediaRecord) -> Result<(), RemoteError> {
        self.check_failing(&key.slug)?;
        self.uploads
            .lock()
            .unwrap()
            .push((key.clone(), media.id.clone()));
        Ok(())
    }
}

/// Record store whose deletes fail for keys containing `needle`
pub struct StuckDeletes {
    inner: MemoryKvStore,
    needle: String,
}

impl StuckDeletes {
    pub fn new(needle: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryKvStore::new(),
            needle: needle.to_string(),
        })
    }
}

impl KvStore for StuckDeletes {
    fn get(&self, ns: &Namespace, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(ns, key)
    }

    fn put(&self, ns: &Namespace, key: &str, value: &[u8]) -> StorageResult<()> {
        self.inner.put(ns, key, value)
    }

    fn delete(&self, ns: &Namespace, key: &str) -> StorageResult<()> {
        if key.contains(&self.needle) {
            return Err(StorageError::LockPoisoned);
        }
        self.inner.delete(ns, key)
    }

    fn scan_prefix(&self, ns: &Namespace, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(ns, prefix)
    }
}

pub fn memory_kv() -> Arc<dyn KvStore> {
    Arc::new(MemoryKvStore::new())
}

pub fn remote_workspace(kv: Arc<dyn KvStore>) -> Arc<Workspace> {
    let context = ContextHandle::remote(ENDPOINT).unwrap();
    Arc::new(Workspace::open(kv, context))
}

pub fn local_workspace(kv: Arc<dyn KvStore>) -> Arc<Workspace> {
    Arc::new(Workspace::open(kv, ContextHandle::local()))
}

pub fn key(owner: &str, slug: &str) -> ProjectKey {
    ProjectKey::new(owner, slug).unwrap()
}

pub fn draft(title: &str) -> ProjectDraft {
    ProjectDraft {
        title: title.to_string(),
        description: None,
    }
}
