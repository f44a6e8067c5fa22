//! Project workspace for one storage context
//!
//! The `Workspace` coordinates everything a context stores about its projects:
//! - the project list (metadata records)
//! - sync state and tombstones
//! - structural and content documents
//! - media
//!
//! Every local change is written first and then marked pending, so the
//! project is usable immediately and the reconciler uploads it later.
//!
//! ## Usage
//!
//! ```ignore
//! let workspace = Workspace::open(kv, registry.active_handle());
//!
//! let key = ProjectKey::new("alice", "my-novel")?;
//! workspace.create_project(&key, draft, None)?;
//! workspace.delete_project(&key, DeleteOptions::default())?;
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::context::ContextHandle;
use crate::document::{DocumentStore, ProjectDocument};
use crate::media::{MediaRecord, MediaStore};
use crate::models::{MetadataPatch, PendingCreation, ProjectDraft, ProjectKey, ProjectRecord};
use crate::storage::{get_json, put_json, scan_json, KvStore, Namespace};
use crate::sync_state::SyncStateStore;
use crate::tombstone::TombstoneRegistry;

const PROJECT_PREFIX: &str = "project:";

/// Options for deleting a project
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Skip writing a tombstone
    ///
    /// Set when the deletion was itself caused by observing a tombstone, so
    /// devices do not keep re-raising each other's deletions.
    pub suppress_tombstone: bool,
}

impl DeleteOptions {
    pub fn suppressed() -> Self {
        Self {
            suppress_tombstone: true,
        }
    }
}

/// All project state held by one storage context
pub struct Workspace {
    context: ContextHandle,
    kv: Arc<dyn KvStore>,
    sync_state: SyncStateStore,
    tombstones: TombstoneRegistry,
    documents: DocumentStore,
    media: MediaStore,
}

impl Workspace {
    /// Open the workspace of a context
    pub fn open(kv: Arc<dyn KvStore>, context: ContextHandle) -> Self {
        let ns = context.namespace.clone();
        Self {
            sync_state: SyncStateStore::for_namespace(kv.clone(), ns.clone()),
            tombstones: TombstoneRegistry::for_namespace(kv.clone(), ns.clone()),
            documents: DocumentStore::new(kv.clone()),
            media: MediaStore::new(kv.clone(), ns),
            context,
            kv,
        }
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn namespace(&self) -> &Namespace {
        &self.context.namespace
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn sync_state(&self) -> &SyncStateStore {
        &self.sync_state
    }

    pub fn tombstones(&self) -> &TombstoneRegistry {
        &self.tombstones
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn media(&self) -> &MediaStore {
        &self.media
    }

    // ==================== Project list ====================

    /// All projects in this context, ordered by key
    pub fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        let records = scan_json::<ProjectRecord>(self.kv.as_ref(), self.namespace(), PROJECT_PREFIX)
            .context("Failed to list projects")?;
        Ok(records.into_iter().map(|(_, r)| r).collect())
    }

    pub fn get_project(&self, key: &ProjectKey) -> Result<Option<ProjectRecord>> {
        get_json(self.kv.as_ref(), self.namespace(), &project_key(key))
            .with_context(|| format!("Failed to read project {}", key))
    }

    /// Write a project record as-is
    pub fn put_project(&self, record: &ProjectRecord) -> Result<()> {
        put_json(self.kv.as_ref(), self.namespace(), &project_key(&record.key), record)
            .with_context(|| format!("Failed to write project {}", record.key))
    }

    // ==================== Local changes ====================

    /// Create a project locally
    ///
    /// In a remote context the project is also queued for remote creation,
    /// which the reconciler performs once connectivity allows.
    pub fn create_project(
        &self,
        key: &ProjectKey,
        draft: ProjectDraft,
        template_id: Option<String>,
    ) -> Result<ProjectRecord> {
        if self.get_project(key)?.is_some() {
            bail!("Project {} already exists", key);
        }
        if self.tombstones.exists(key)? {
            bail!("Project {} was deleted and cannot be recreated", key);
        }

        let mut record = ProjectRecord::new(key.clone(), draft.title.clone());
        record.description = draft.description.clone();
        record.template_id = template_id.clone();
        self.put_project(&record)?;

        let mut doc = ProjectDocument::new();
        self.documents
            .save_project(self.namespace(), key, &mut doc)
            .context("Failed to save structural document")?;

        if !self.context.is_local() {
            self.sync_state
                .mark_pending_creation(key, PendingCreation::new(draft, template_id))
                .context("Failed to queue project creation")?;
        }

        info!(project = %key, namespace = %self.namespace(), "Created project");
        Ok(record)
    }

    /// Edit project metadata locally
    ///
    /// Only fields whose value actually changes are queued for upload.
    pub fn update_metadata(&self, key: &ProjectKey, patch: &MetadataPatch) -> Result<ProjectRecord> {
        let mut record = self
            .get_project(key)?
            .with_context(|| format!("Project {} not found", key))?;

        let changes = patch.changes_against(
            &record.title,
            record.description.as_deref(),
            record.cover_media_id.as_deref(),
        );
        if changes.is_empty() {
            debug!(project = %key, "Metadata unchanged");
            return Ok(record);
        }

        record.apply_patch(&changes);
        self.put_project(&record)?;

        if !self.context.is_local() {
            self.sync_state
                .mark_pending_metadata(key, &changes)
                .context("Failed to queue metadata edit")?;
        }
        Ok(record)
    }

    /// Store a media blob for a project and queue it for upload
    pub fn add_media(&self, key: &ProjectKey, record: &MediaRecord) -> Result<()> {
        if self.get_project(key)?.is_none() {
            bail!("Project {} not found", key);
        }
        self.media
            .put(key, record)
            .with_context(|| format!("Failed to store media {}", record.id))?;

        if !self.context.is_local() {
            self.sync_state
                .mark_pending_upload(key, &record.id)
                .context("Failed to queue media upload")?;
        }
        Ok(())
    }

    /// Delete a project and everything stored for it
    ///
    /// Writes a tombstone unless `options.suppress_tombstone` is set.
    pub fn delete_project(&self, key: &ProjectKey, options: DeleteOptions) -> Result<()> {
        let ns = self.namespace();

        self.documents
            .delete_all(ns, key)
            .context("Failed to delete project documents")?;
        self.media
            .delete_all(key)
            .context("Failed to delete project media")?;
        self.sync_state
            .delete_state(key)
            .context("Failed to delete sync state")?;
        self.kv
            .delete(ns, &project_key(key))
            .context("Failed to delete project record")?;

        if !options.suppress_tombstone {
            self.tombstones
                .create(key)
                .context("Failed to record tombstone")?;
        }

        info!(
            project = %key,
            namespace = %ns,
            tombstone = !options.suppress_tombstone,
            "Deleted project"
        );
        Ok(())
    }

    /// Move a project to a new identity within this context
    ///
    /// Used when the remote authority assigns a different key than the local
    /// placeholder. The old identity is removed without a tombstone.
    pub fn rekey_project(&self, from: &ProjectKey, to: &ProjectKey) -> Result<ProjectRecord> {
        let mut record = self
            .get_project(from)?
            .with_context(|| format!("Project {} not found", from))?;
        if from == to {
            return Ok(record);
        }

        record.key = to.clone();
        record.updated_at = Utc::now();
        self.put_project(&record)?;

        self.documents
            .copy_project(self.namespace(), from, to)
            .context("Failed to copy project documents")?;
        for media in self.media.list(from)? {
            self.media.put(to, &media)?;
        }
        self.sync_state
            .move_state(from, to)
            .context("Failed to move sync state")?;

        self.delete_project(from, DeleteOptions::suppressed())?;
        info!(from = %from, to = %to, "Re-keyed project");
        Ok(record)
    }
}

fn project_key(key: &ProjectKey) -> String {
    format!("{}{}", PROJECT_PREFIX, key.storage_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ContentDocument, Element, ElementKind};
    use crate::storage::MemoryKvStore;
    use crate::sync_state::SyncStatus;

    fn remote_workspace() -> Workspace {
        let context = ContextHandle::remote("https://quire.example.com").unwrap();
        Workspace::open(Arc::new(MemoryKvStore::new()), context)
    }

    fn draft(title: &str) -> ProjectDraft {
        ProjectDraft {
            title: title.to_string(),
            description: None,
        }
    }

    #[test]
    fn test_create_marks_pending_creation() {
        let ws = remote_workspace();
        let key = ProjectKey::new("alice", "my-novel").unwrap();

        ws.create_project(&key, draft("My Novel"), None).unwrap();

        let state = ws.sync_state().get_state(&key);
        assert!(state.pending_creation.is_some());
        assert_eq!(state.status, SyncStatus::Pending);
        assert_eq!(ws.list_projects().unwrap().len(), 1);

        assert!(ws.create_project(&key, draft("Again"), None).is_err());
    }

    #[test]
    fn test_local_context_queues_nothing() {
        let ws = Workspace::open(Arc::new(MemoryKvStore::new()), ContextHandle::local());
        let key = ProjectKey::new("local", "notes").unwrap();

        ws.create_project(&key, draft("Notes"), None).unwrap();
        ws.update_metadata(
            &key,
            &MetadataPatch {
                title: Some("Renamed".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(ws.sync_state().get_state(&key).status, SyncStatus::OfflineOnly);
    }

    #[test]
    fn test_update_metadata_queues_only_changes() {
        let ws = remote_workspace();
        let key = ProjectKey::new("alice", "my-novel").unwrap();
        ws.create_project(&key, draft("My Novel"), None).unwrap();
        ws.sync_state().clear_pending_creation(&key).unwrap();

        let record = ws
            .update_metadata(
                &key,
                &MetadataPatch {
                    title: Some("My Novel".to_string()),
                    description: Some("A story".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(record.description.as_deref(), Some("A story"));

        let pending = ws
            .sync_state()
            .get_state(&key)
            .pending_metadata_edit
            .unwrap();
        assert!(pending.title.is_none());
        assert_eq!(pending.description.as_deref(), Some("A story"));
    }

    #[test]
    fn test_delete_twice_yields_one_tombstone() {
        let ws = remote_workspace();
        let key = ProjectKey::new("alice", "my-novel").unwrap();
        ws.create_project(&key, draft("My Novel"), None).unwrap();

        ws.delete_project(&key, DeleteOptions::default()).unwrap();
        ws.delete_project(&key, DeleteOptions::suppressed()).unwrap();

        assert_eq!(ws.tombstones().list_all().unwrap().len(), 1);
        assert!(ws.get_project(&key).unwrap().is_none());
        assert!(!ws.sync_state().get_state(&key).has_pending());
        assert!(ws.create_project(&key, draft("Back"), None).is_err());
    }

    #[test]
    fn test_delete_with_corrupt_structure_document() {
        let ws = remote_workspace();
        let key = ProjectKey::new("alice", "my-novel").unwrap();
        ws.create_project(&key, draft("My Novel"), None).unwrap();
        ws.add_media(&key, &MediaRecord::new("cover.png", "image/png", vec![1, 2, 3]))
            .unwrap();
        ws.kv()
            .put(ws.namespace(), "doc:alice:my-novel:elements", b"junk")
            .unwrap();

        ws.delete_project(&key, DeleteOptions::default()).unwrap();

        assert!(ws.get_project(&key).unwrap().is_none());
        assert!(ws.media().list(&key).unwrap().is_empty());
        assert!(ws.documents().project_bytes(ws.namespace(), &key).unwrap().is_none());
        assert!(!ws.sync_state().get_state(&key).has_pending());
        assert!(ws.tombstones().exists(&key).unwrap());
    }

    #[test]
    fn test_suppressed_delete_writes_no_tombstone() {
        let ws = remote_workspace();
        let key = ProjectKey::new("alice", "my-novel").unwrap();
        ws.create_project(&key, draft("My Novel"), None).unwrap();

        ws.delete_project(&key, DeleteOptions::suppressed()).unwrap();
        assert!(ws.tombstones().list_all().unwrap().is_empty());
    }

    #[test]
    fn test_rekey_moves_everything() {
        let ws = remote_workspace();
        let from = ProjectKey::new("alice", "my-novel").unwrap();
        let to = ProjectKey::new("alice", "my-novel-1").unwrap();
        ws.create_project(&from, draft("My Novel"), None).unwrap();

        let chapter = Element::new("Chapter 1", ElementKind::Document);
        let mut doc = ws.documents().load_project(ws.namespace(), &from).unwrap().unwrap();
        doc.put_element(&chapter).unwrap();
        ws.documents().save_project(ws.namespace(), &from, &mut doc).unwrap();
        let mut body = ContentDocument::new();
        body.set_text("Opening line").unwrap();
        ws.documents().save_content(&from, &chapter.id, &mut body).unwrap();
        ws.add_media(&from, &MediaRecord::new("c.png", "image/png", vec![7])).unwrap();

        ws.rekey_project(&from, &to).unwrap();

        assert!(ws.get_project(&from).unwrap().is_none());
        assert_eq!(ws.get_project(&to).unwrap().unwrap().key, to);
        assert_eq!(ws.media().list(&to).unwrap().len(), 1);
        let state = ws.sync_state().get_state(&to);
        assert!(state.pending_creation.is_some());
        assert_eq!(state.pending_uploads.len(), 1);
        let body = ws.documents().load_content(&to, &chapter.id).unwrap().unwrap();
        assert_eq!(body.text().unwrap(), "Opening line");
        assert!(ws.tombstones().list_all().unwrap().is_empty());
    }
}
