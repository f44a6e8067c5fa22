//! Per-project sync state
//!
//! Tracks the local changes a project still owes the remote authority:
//! pending media uploads, a pending metadata edit and a pending creation.
//! The overall [`SyncStatus`] is never assigned directly; it is recomputed by
//! [`derive_status`] after every mutation.
//!
//! Each namespace has its own store. Mutators update the in-memory entry and
//! write it through before returning, so a reader never sees a half-applied
//! change.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::ContextHandle;
use crate::models::{MetadataPatch, PendingCreation, ProjectKey};
use crate::storage::{get_json, put_json, scan_json, KvStore, Namespace, StorageError, StorageResult};

const STATE_PREFIX: &str = "sync:";

/// Overall sync status of a project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    #[default]
    OfflineOnly,
    Pending,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::OfflineOnly => "offline-only",
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }
}

/// Sync state of one project within a namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSyncState {
    pub project_key: ProjectKey,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_uploads: BTreeSet<String>,
    #[serde(default)]
    pub pending_metadata_edit: Option<MetadataPatch>,
    #[serde(default)]
    pub pending_creation: Option<PendingCreation>,
    #[serde(default)]
    pub status: SyncStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set while a reconciliation pass is working on this project
    #[serde(skip)]
    pub in_flight: bool,
}

impl ProjectSyncState {
    pub fn new(project_key: ProjectKey) -> Self {
        Self {
            project_key,
            last_sync_at: None,
            pending_uploads: BTreeSet::new(),
            pending_metadata_edit: None,
            pending_creation: None,
            status: SyncStatus::OfflineOnly,
            last_error: None,
            in_flight: false,
        }
    }

    /// Whether any local change is still unconfirmed
    pub fn has_pending(&self) -> bool {
        !self.pending_uploads.is_empty()
            || self.pending_metadata_edit.is_some()
            || self.pending_creation.is_some()
    }

    fn recompute(&mut self) {
        if self
            .pending_metadata_edit
            .as_ref()
            .is_some_and(MetadataPatch::is_empty)
        {
            self.pending_metadata_edit = None;
        }
        self.status = derive_status(self);
    }
}

/// Derive the status of a project from its pending fields
///
/// An explicitly recorded error wins until a success clears it, then an
/// in-flight pass. Otherwise the project is `pending` exactly when something
/// is unconfirmed, `synced` when nothing is and it has synced before, and
/// `offline-only` when it never has.
pub fn derive_status(state: &ProjectSyncState) -> SyncStatus {
    if state.last_error.is_some() {
        SyncStatus::Error
    } else if state.in_flight {
        SyncStatus::Syncing
    } else if state.has_pending() {
        SyncStatus::Pending
    } else if state.last_sync_at.is_some() {
        SyncStatus::Synced
    } else {
        SyncStatus::OfflineOnly
    }
}

/// Sync state store for one namespace
pub struct SyncStateStore {
    kv: Arc<dyn KvStore>,
    namespace: Namespace,
    cache: Mutex<HashMap<ProjectKey, ProjectSyncState>>,
}

impl SyncStateStore {
    pub fn new(kv: Arc<dyn KvStore>, context: &ContextHandle) -> Self {
        Self::for_namespace(kv, context.namespace.clone())
    }

    pub fn for_namespace(kv: Arc<dyn KvStore>, namespace: Namespace) -> Self {
        Self {
            kv,
            namespace,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Current state of a project, defaulting to `offline-only`
    ///
    /// Storage failures degrade to the default state.
    pub fn get_state(&self, key: &ProjectKey) -> ProjectSyncState {
        let loaded = self
            .lock()
            .and_then(|mut cache| self.hydrate(&mut cache, key).cloned());
        match loaded {
            Ok(state) => state,
            Err(e) => {
                warn!(project = %key, error = %e, "Failed to load sync state");
                ProjectSyncState::new(key.clone())
            }
        }
    }

    pub fn mark_pending_upload(&self, key: &ProjectKey, media_id: &str) -> StorageResult<ProjectSyncState> {
        self.mutate(key, |state| {
            state.pending_uploads.insert(media_id.to_string());
            state.last_error = None;
        })
    }

    pub fn clear_pending_upload(&self, key: &ProjectKey, media_id: &str) -> StorageResult<ProjectSyncState> {
        self.mutate(key, |state| {
            state.pending_uploads.remove(media_id);
        })
    }

    /// Merge edited fields into the pending metadata edit
    pub fn mark_pending_metadata(&self, key: &ProjectKey, fields: &MetadataPatch) -> StorageResult<ProjectSyncState> {
        self.mutate(key, |state| {
            match state.pending_metadata_edit {
                Some(ref mut pending) => pending.merge(fields),
                None => state.pending_metadata_edit = Some(fields.clone()),
            }
            state.last_error = None;
        })
    }

    /// Clear the fields of the pending edit that still hold the values in `sent`
    ///
    /// Fields edited again after `sent` was taken stay pending.
    pub fn clear_pending_metadata(&self, key: &ProjectKey, sent: &MetadataPatch) -> StorageResult<ProjectSyncState> {
        self.mutate(key, |state| {
            if let Some(ref mut pending) = state.pending_metadata_edit {
                if pending.title.is_some() && pending.title == sent.title {
                    pending.title = None;
                }
                if pending.description.is_some() && pending.description == sent.description {
                    pending.description = None;
                }
                if pending.cover_media_id.is_some() && pending.cover_media_id == sent.cover_media_id {
                    pending.cover_media_id = None;
                }
            }
        })
    }

    pub fn mark_pending_creation(&self, key: &ProjectKey, creation: PendingCreation) -> StorageResult<ProjectSyncState> {
        self.mutate(key, |state| {
            state.pending_creation = Some(creation);
            state.last_error = None;
        })
    }

    pub fn clear_pending_creation(&self, key: &ProjectKey) -> StorageResult<ProjectSyncState> {
        self.mutate(key, |state| {
            state.pending_creation = None;
        })
    }

    /// Clear every pending field and stamp a successful sync
    pub fn mark_synced(&self, key: &ProjectKey) -> StorageResult<ProjectSyncState> {
        self.mutate(key, |state| {
            state.pending_uploads.clear();
            state.pending_metadata_edit = None;
            state.pending_creation = None;
            state.last_error = None;
            state.last_sync_at = Some(Utc::now());
        })
    }

    /// Stamp a successful remote round trip without touching pending fields
    pub fn record_success(&self, key: &ProjectKey) -> StorageResult<ProjectSyncState> {
        self.mutate(key, |state| {
            state.last_error = None;
            state.last_sync_at = Some(Utc::now());
        })
    }

    /// Record a failed attempt
    ///
    /// Pending fields are left as they are so the work is retried.
    pub fn mark_sync_error(&self, key: &ProjectKey, message: &str) -> StorageResult<ProjectSyncState> {
        self.mutate(key, |state| {
            state.last_error = Some(message.to_string());
        })
    }

    pub fn mark_in_flight(&self, key: &ProjectKey, in_flight: bool) -> StorageResult<ProjectSyncState> {
        self.mutate(key, |state| {
            state.in_flight = in_flight;
        })
    }

    /// Forget a project's state entirely
    pub fn delete_state(&self, key: &ProjectKey) -> StorageResult<()> {
        let mut cache = self.lock()?;
        cache.remove(key);
        self.kv.delete(&self.namespace, &state_key(key))
    }

    /// Move a project's state to a new key, replacing anything stored there
    pub fn move_state(&self, from: &ProjectKey, to: &ProjectKey) -> StorageResult<ProjectSyncState> {
        let mut cache = self.lock()?;
        let mut state = self.hydrate(&mut cache, from)?.clone();
        state.project_key = to.clone();
        state.recompute();

        put_json(self.kv.as_ref(), &self.namespace, &state_key(to), &state)?;
        self.kv.delete(&self.namespace, &state_key(from))?;
        cache.remove(from);
        cache.insert(to.clone(), state.clone());
        Ok(state)
    }

    /// Every project with any pending field, from storage and cache
    pub fn projects_with_pending_changes(&self) -> StorageResult<Vec<ProjectKey>> {
        Ok(self
            .all_states()?
            .into_iter()
            .filter(ProjectSyncState::has_pending)
            .map(|s| s.project_key)
            .collect())
    }

    /// Every project with a pending creation, from storage and cache
    pub fn projects_with_pending_creations(&self) -> StorageResult<Vec<ProjectKey>> {
        Ok(self
            .all_states()?
            .into_iter()
            .filter(|s| s.pending_creation.is_some())
            .map(|s| s.project_key)
            .collect())
    }

    /// All known states, sorted by project key
    ///
    /// Persisted state is scanned because the store may hold entries from a
    /// previous session that were never loaded into the cache.
    pub fn all_states(&self) -> StorageResult<Vec<ProjectSyncState>> {
        let cache = self.lock()?;
        let mut merged: HashMap<ProjectKey, ProjectSyncState> = HashMap::new();

        for (_, mut state) in scan_json::<ProjectSyncState>(self.kv.as_ref(), &self.namespace, STATE_PREFIX)? {
            state.recompute();
            merged.insert(state.project_key.clone(), state);
        }
        for (key, state) in cache.iter() {
            merged.insert(key.clone(), state.clone());
        }

        let mut states: Vec<_> = merged.into_values().collect();
        states.sort_by(|a, b| a.project_key.cmp(&b.project_key));
        Ok(states)
    }

    fn mutate<F>(&self, key: &ProjectKey, apply: F) -> StorageResult<ProjectSyncState>
    where
        F: FnOnce(&mut ProjectSyncState),
    {
        let mut cache = self.lock()?;
        let state = self.hydrate(&mut cache, key)?;
        apply(state);
        state.recompute();
        let snapshot = state.clone();

        // Written under the cache lock so disk order matches mutation order
        put_json(self.kv.as_ref(), &self.namespace, &state_key(key), &snapshot)?;
        drop(cache);
        debug!(project = %key, status = snapshot.status.as_str(), "Sync state updated");
        Ok(snapshot)
    }

    fn hydrate<'a>(
        &self,
        cache: &'a mut HashMap<ProjectKey, ProjectSyncState>,
        key: &ProjectKey,
    ) -> StorageResult<&'a mut ProjectSyncState> {
        if !cache.contains_key(key) {
            let mut state = get_json::<ProjectSyncState>(self.kv.as_ref(), &self.namespace, &state_key(key))?
                .filter(|s| &s.project_key == key)
                .unwrap_or_else(|| ProjectSyncState::new(key.clone()));
            state.recompute();
            cache.insert(key.clone(), state);
        }
        cache
            .get_mut(key)
            .ok_or(StorageError::LockPoisoned)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, HashMap<ProjectKey, ProjectSyncState>>> {
        self.cache.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

fn state_key(key: &ProjectKey) -> String {
    format!("{}{}", STATE_PREFIX, key.storage_id())
}
