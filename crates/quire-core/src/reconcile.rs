//! Background reconciliation
//!
//! Drains pending local state to the remote authority. A pass runs, in order:
//!
//! 1. **Tombstone sweep**: projects with a pending creation that are
//!    tombstoned locally or (when online) remotely are deleted locally,
//!    without raising a new tombstone
//! 2. **Pending creations**: each remaining project is created remotely
//! 3. **Pending metadata**: edits are merged against the server's current
//!    values and only changed fields are sent
//! 4. **Pending uploads**: media blobs are uploaded one by one
//!
//! Failures are recorded on the project they belong to and never stop the
//! pass. Passes are triggered by connectivity changes and never overlap.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{MetadataPatch, ProjectKey, Tombstone};
use crate::remote::{CreateProjectRequest, RemoteError, RemoteProject, RemoteProjectApi};
use crate::workspace::{DeleteOptions, Workspace};

/// Network reachability as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Publishes connectivity changes to reconcilers
pub struct ConnectivityMonitor {
    tx: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    /// Report the current connectivity; repeated values are not re-broadcast
    pub fn set(&self, connectivity: Connectivity) {
        self.tx.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// Projects deleted because they were tombstoned
    pub swept: Vec<ProjectKey>,
    /// Projects created remotely, under their authoritative key
    pub created: Vec<ProjectKey>,
    pub metadata_synced: Vec<ProjectKey>,
    pub uploads_synced: usize,
    /// Per-project failure messages
    pub failures: BTreeMap<ProjectKey, String>,
}

impl PassReport {
    /// True only if every item in the pass succeeded
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Resets the in-flight flag when a pass ends, however it ends
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Reconciles one workspace against its remote authority
pub struct Reconciler {
    workspace: Arc<Workspace>,
    remote: Arc<dyn RemoteProjectApi>,
    in_flight: AtomicBool,
}

impl Reconciler {
    pub fn new(workspace: Arc<Workspace>, remote: Arc<dyn RemoteProjectApi>) -> Self {
        Self {
            workspace,
            remote,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Whether a pass is currently running
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run reconciliation in the background
    ///
    /// Runs one pass immediately if already online, then one pass on every
    /// offline to online transition. Stops when the monitor is dropped.
    pub fn spawn(self: Arc<Self>, mut connectivity: watch::Receiver<Connectivity>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last = *connectivity.borrow_and_update();
            if last == Connectivity::Online {
                self.run_pass(true).await;
            }

            while connectivity.changed().await.is_ok() {
                let now = *connectivity.borrow_and_update();
                if now == Connectivity::Online && last == Connectivity::Offline {
                    info!("Connectivity restored, reconciling");
                    self.run_pass(true).await;
                }
                last = now;
            }
            debug!("Connectivity monitor closed, reconciler stopping");
        })
    }

    /// Run one pass
    ///
    /// Returns `None` without doing anything if a pass is already running.
    /// While offline only the local tombstone sweep runs.
    pub async fn run_pass(&self, online: bool) -> Option<PassReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reconciliation pass already running");
            return None;
        }
        let _guard = PassGuard(&self.in_flight);

        let mut report = PassReport::default();
        let ns = self.workspace.namespace().clone();
        info!(namespace = %ns, online, "Starting reconciliation pass");

        let tombstoned = match self.sweep_tombstones(online, &mut report).await {
            Ok(tombstoned) => Some(tombstoned),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Tombstone sweep failed");
                None
            }
        };

        if online {
            match tombstoned {
                Some(ref tombstoned) => {
                    if let Err(e) = self.drain_creations(tombstoned, &mut report).await {
                        warn!(error = %e, "Failed to enumerate pending creations");
                    }
                }
                None => warn!("Skipping pending creations until a tombstone sweep completes"),
            }
            if let Err(e) = self.drain_metadata(&mut report).await {
                warn!(error = %e, "Failed to enumerate pending metadata");
            }
            if let Err(e) = self.drain_uploads(&mut report).await {
                warn!(error = %e, "Failed to enumerate pending uploads");
            }
        }

        info!(
            namespace = %ns,
            swept = report.swept.len(),
            created = report.created.len(),
            metadata = report.metadata_synced.len(),
            uploads = report.uploads_synced,
            failed = report.failures.len(),
            "Reconciliation pass finished"
        );
        Some(report)
    }

    // ==================== Steps ====================

    /// Delete pending-creation projects that carry a tombstone
    ///
    /// Returns every tombstoned key, including ones whose local delete
    /// failed: those keep their pending creation so the next pass retries
    /// the delete, and must not be created remotely. Fails if the remote
    /// tombstones could not be checked while online.
    async fn sweep_tombstones(&self, online: bool, report: &mut PassReport) -> Result<BTreeSet<ProjectKey>> {
        let pending = self.workspace.sync_state().projects_with_pending_creations()?;
        if pending.is_empty() {
            return Ok(BTreeSet::new());
        }

        let mut tombstoned: BTreeSet<ProjectKey> = BTreeSet::new();
        for key in &pending {
            if self.workspace.tombstones().exists(key)? {
                tombstoned.insert(key.clone());
            }
        }

        let remote_check = if online {
            match self.remote.check_tombstones(&pending).await {
                Ok(remote) => {
                    tombstoned.extend(remote.into_iter().map(|t: Tombstone| t.key));
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };
        tombstoned.retain(|key| pending.contains(key));

        for key in &tombstoned {
            match self.workspace.delete_project(key, DeleteOptions::suppressed()) {
                Ok(()) => {
                    info!(project = %key, "Removed tombstoned project");
                    report.swept.push(key.clone());
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(project = %key, error = %message, "Failed to remove tombstoned project");
                    self.record_failure(key, &message);
                    report.failures.insert(key.clone(), message);
                }
            }
        }

        remote_check.context("Remote tombstone check failed")?;
        Ok(tombstoned)
    }

    async fn drain_creations(&self, tombstoned: &BTreeSet<ProjectKey>, report: &mut PassReport) -> Result<()> {
        for key in self.workspace.sync_state().projects_with_pending_creations()? {
            if tombstoned.contains(&key) {
                debug!(project = %key, "Not creating tombstoned project");
                continue;
            }
            match self.create_one(&key).await {
                Ok(created) => report.created.push(created),
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(project = %key, error = %message, "Remote creation failed");
                    self.record_failure(&key, &message);
                    report.failures.insert(key, message);
                }
            }
        }
        Ok(())
    }

    async fn create_one(&self, key: &ProjectKey) -> Result<ProjectKey> {
        let sync = self.workspace.sync_state();
        let Some(creation) = sync.get_state(key).pending_creation else {
            return Ok(key.clone());
        };

        sync.mark_in_flight(key, true)?;
        let request = CreateProjectRequest {
            slug: key.slug.clone(),
            title: creation.draft.title.clone(),
            description: creation.draft.description.clone(),
            template_id: creation.template_id.clone(),
        };

        let result = self.remote.create_project(&key.owner, &request).await;
        sync.mark_in_flight(key, false)?;

        let (authoritative, remote_id) = match result {
            Ok(project) => {
                let remote_key = project
                    .key()
                    .with_context(|| format!("Server returned an invalid key for {}", key))?;
                (remote_key, Some(project.id))
            }
            Err(RemoteError::Conflict { existing }) => {
                debug!(project = %key, "Project already exists remotely");
                (key.clone(), self.check_existing_identity(key, existing.as_ref()))
            }
            Err(e) => return Err(e.into()),
        };

        if &authoritative != key {
            self.workspace
                .rekey_project(key, &authoritative)
                .with_context(|| format!("Failed to re-key {} to {}", key, authoritative))?;
        }
        if let Some(id) = remote_id {
            if let Some(mut record) = self.workspace.get_project(&authoritative)? {
                record.remote_id = Some(id);
                self.workspace.put_project(&record)?;
            }
        }

        sync.clear_pending_creation(&authoritative)?;
        sync.record_success(&authoritative)?;
        info!(project = %authoritative, "Created project remotely");
        Ok(authoritative)
    }

    /// Accept a duplicate-create response, flagging an identity mismatch
    ///
    /// If the server's existing project has a different key, the local key
    /// is kept and only a warning is emitted.
    fn check_existing_identity(&self, key: &ProjectKey, existing: Option<&RemoteProject>) -> Option<String> {
        let existing = existing?;
        match existing.key() {
            Ok(ref remote_key) if remote_key == key => Some(existing.id.clone()),
            Ok(remote_key) => {
                warn!(
                    project = %key,
                    remote = %remote_key,
                    remote_id = %existing.id,
                    "Existing remote project has a different identity; keeping the local key"
                );
                None
            }
            Err(e) => {
                warn!(project = %key, error = %e, "Existing remote project has an invalid key");
                None
            }
        }
    }

    async fn drain_metadata(&self, report: &mut PassReport) -> Result<()> {
        let sync = self.workspace.sync_state();
        for key in sync.projects_with_pending_changes()? {
            let state = sync.get_state(&key);
            if state.pending_creation.is_some() {
                continue;
            }
            let Some(pending) = state.pending_metadata_edit else {
                continue;
            };

            match self.push_metadata(&key, &pending).await {
                Ok(()) => report.metadata_synced.push(key),
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(project = %key, error = %message, "Metadata sync failed");
                    self.record_failure(&key, &message);
                    report.failures.insert(key, message);
                }
            }
        }
        Ok(())
    }

    async fn push_metadata(&self, key: &ProjectKey, pending: &MetadataPatch) -> Result<()> {
        let current = self.remote.get_project(key).await?;
        let changes = pending.changes_against(
            &current.title,
            current.description.as_deref(),
            current.cover_media_id.as_deref(),
        );

        if changes.is_empty() {
            debug!(project = %key, "Server already has the pending metadata");
        } else {
            self.remote.update_project(key, &changes).await?;
        }

        let sync = self.workspace.sync_state();
        sync.clear_pending_metadata(key, pending)?;
        sync.record_success(key)?;
        Ok(())
    }

    async fn drain_uploads(&self, report: &mut PassReport) -> Result<()> {
        let sync = self.workspace.sync_state();
        for key in sync.projects_with_pending_changes()? {
            let state = sync.get_state(&key);
            if state.pending_creation.is_some() || state.pending_uploads.is_empty() {
                continue;
            }

            for media_id in state.pending_uploads {
                match self.upload_one(&key, &media_id).await {
                    Ok(true) => report.uploads_synced += 1,
                    Ok(false) => {}
                    Err(e) => {
                        let message = format!("{:#}", e);
                        warn!(project = %key, media = %media_id, error = %message, "Upload failed");
                        self.record_failure(&key, &message);
                        report.failures.insert(key.clone(), message);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Upload one blob; returns false if the blob no longer exists locally
    async fn upload_one(&self, key: &ProjectKey, media_id: &str) -> Result<bool> {
        let sync = self.workspace.sync_state();
        let Some(media) = self.workspace.media().get(key, media_id)? else {
            warn!(project = %key, media = media_id, "Pending media is missing locally, dropping it");
            sync.clear_pending_upload(key, media_id)?;
            return Ok(false);
        };

        self.remote.upload_media(key, &media).await?;
        sync.clear_pending_upload(key, media_id)?;
        sync.record_success(key)?;
        Ok(true)
    }

    fn record_failure(&self, key: &ProjectKey, message: &str) {
        let sync = self.workspace.sync_state();
        if let Err(e) = sync
            .mark_in_flight(key, false)
            .and_then(|_| sync.mark_sync_error(key, message))
        {
            warn!(project = %key, error = %e, "Failed to record sync error");
        }
    }
}
