//! Migration between storage contexts
//!
//! Copies projects from a source workspace into a target workspace without
//! touching the network. Each project goes through four stages, in order:
//!
//! 1. **Elements**: the structural document
//! 2. **Documents**: one content document per content-bearing element
//! 3. **Media**: every media blob with its metadata
//! 4. **Project entry**: the project record, a [`MigrationRecord`] and, for a
//!    remote target, a pending creation for the reconciler
//!
//! Every stage can be re-run on its own. A failure stops the remaining stages
//! of that project only; the other requested projects still migrate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::document::{ContentDocument, DocumentError, ProjectDocument};
use crate::models::{
    validate_owner, validate_slug, MigrationRecord, ModelError, PendingCreation, ProjectKey,
    ProjectRecord,
};
use crate::storage::{get_json, put_json, scan_json, StorageError};
use crate::workspace::Workspace;

const MIGRATION_PREFIX: &str = "migration:";

/// Errors raised by the migration engine
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Invalid migration request: {0}")]
    Validation(String),

    #[error("Project {0} not found in the source context")]
    ProjectNotFound(ProjectKey),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Workspace(#[from] anyhow::Error),
}

/// One step of a project migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStage {
    Elements,
    Documents,
    Media,
    ProjectEntry,
}

impl MigrationStage {
    /// All stages in execution order
    pub const ALL: [MigrationStage; 4] = [
        MigrationStage::Elements,
        MigrationStage::Documents,
        MigrationStage::Media,
        MigrationStage::ProjectEntry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStage::Elements => "elements",
            MigrationStage::Documents => "documents",
            MigrationStage::Media => "media",
            MigrationStage::ProjectEntry => "project-entry",
        }
    }
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Started,
    Completed,
    Failed(String),
}

/// A progress event delivered to the caller
#[derive(Debug, Clone)]
pub struct MigrationProgress {
    pub project: ProjectKey,
    pub stage: MigrationStage,
    pub status: StageStatus,
    /// Position of this project in the run (0-based) and the run's size
    pub index: usize,
    pub total: usize,
}

/// What to migrate
#[derive(Debug, Clone, Default)]
pub struct MigrationRequest {
    /// Owner of the migrated projects in the target context
    pub target_owner: String,
    /// Explicit subset of source projects
    ///
    /// `None` migrates every eligible project; `Some(vec![])` migrates
    /// nothing.
    pub projects: Option<Vec<ProjectKey>>,
    /// New slugs for individual source projects
    pub renames: BTreeMap<ProjectKey, String>,
}

impl MigrationRequest {
    pub fn new(target_owner: impl Into<String>) -> Self {
        Self {
            target_owner: target_owner.into(),
            ..Default::default()
        }
    }

    pub fn with_projects(mut self, projects: Vec<ProjectKey>) -> Self {
        self.projects = Some(projects);
        self
    }

    pub fn with_rename(mut self, project: ProjectKey, slug: impl Into<String>) -> Self {
        self.renames.insert(project, slug.into());
        self
    }
}

/// The stage a project failed in, with the captured message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: MigrationStage,
    pub message: String,
}

/// Result of migrating one project
#[derive(Debug, Clone)]
pub struct ProjectOutcome {
    pub original_key: ProjectKey,
    pub migrated_key: ProjectKey,
    pub failure: Option<StageFailure>,
}

impl ProjectOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Result of a migration run
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub outcomes: Vec<ProjectOutcome>,
}

impl MigrationReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &ProjectOutcome> {
        self.outcomes.iter().filter(|o| o.succeeded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ProjectOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(ProjectOutcome::succeeded)
    }
}

/// Copies projects from one workspace into another
pub struct MigrationEngine<'a> {
    source: &'a Workspace,
    target: &'a Workspace,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(source: &'a Workspace, target: &'a Workspace) -> Self {
        Self { source, target }
    }

    /// Source projects with no migration record for the target
    pub fn eligible_projects(&self) -> Result<Vec<ProjectRecord>, MigrationError> {
        let migrated: Vec<ProjectKey> = scan_json::<MigrationRecord>(
            self.source.kv().as_ref(),
            self.source.namespace(),
            &self.record_prefix(),
        )?
        .into_iter()
        .map(|(_, r)| r.original_key)
        .collect();

        Ok(self
            .source
            .list_projects()?
            .into_iter()
            .filter(|p| !migrated.contains(&p.key))
            .collect())
    }

    /// Migration record of a source project for the target, if any
    pub fn migration_record(&self, key: &ProjectKey) -> Result<Option<MigrationRecord>, MigrationError> {
        Ok(get_json(
            self.source.kv().as_ref(),
            self.source.namespace(),
            &self.record_key(key),
        )?)
    }

    /// Key a source project will have in the target
    pub fn target_key(&self, source: &ProjectKey, request: &MigrationRequest) -> Result<ProjectKey, MigrationError> {
        let slug = request
            .renames
            .get(source)
            .map(String::as_str)
            .unwrap_or(source.slug.as_str());
        validate_slug(slug).map_err(|e| MigrationError::Validation(e.to_string()))?;
        Ok(ProjectKey::new(request.target_owner.clone(), slug)?)
    }

    /// Run a migration
    ///
    /// Invalid input fails the whole run before anything is copied. After
    /// that, a failing project is reported in its outcome and the run moves
    /// on to the next project.
    pub fn run<F>(&self, request: &MigrationRequest, mut on_progress: F) -> Result<MigrationReport, MigrationError>
    where
        F: FnMut(&MigrationProgress),
    {
        let plan = self.plan(request)?;
        let total = plan.len();
        info!(
            projects = total,
            from = %self.source.namespace(),
            to = %self.target.namespace(),
            "Starting migration"
        );

        let mut report = MigrationReport::default();
        for (index, (source_key, target_key)) in plan.into_iter().enumerate() {
            let failure = self.migrate_project(&source_key, &target_key, |stage, status| {
                on_progress(&MigrationProgress {
                    project: source_key.clone(),
                    stage,
                    status,
                    index,
                    total,
                })
            });

            if let Some(ref f) = failure {
                error!(project = %source_key, stage = %f.stage, error = %f.message, "Project migration failed");
            }
            report.outcomes.push(ProjectOutcome {
                original_key: source_key,
                migrated_key: target_key,
                failure,
            });
        }

        info!(
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            "Migration finished"
        );
        Ok(report)
    }

    /// Run every stage for one project, stopping at the first failure
    pub fn migrate_project<F>(&self, source: &ProjectKey, target: &ProjectKey, mut on_stage: F) -> Option<StageFailure>
    where
        F: FnMut(MigrationStage, StageStatus),
    {
        for stage in MigrationStage::ALL {
            on_stage(stage, StageStatus::Started);
            if let Err(e) = self.run_stage(stage, source, target) {
                let message = e.to_string();
                on_stage(stage, StageStatus::Failed(message.clone()));
                return Some(StageFailure { stage, message });
            }
            on_stage(stage, StageStatus::Completed);
        }
        None
    }

    /// Run a single stage
    ///
    /// Safe to repeat: re-applying copied data onto the target is a no-op.
    pub fn run_stage(&self, stage: MigrationStage, source: &ProjectKey, target: &ProjectKey) -> Result<(), MigrationError> {
        match stage {
            MigrationStage::Elements => self.copy_elements(source, target),
            MigrationStage::Documents => self.copy_documents(source, target),
            MigrationStage::Media => self.copy_media(source, target),
            MigrationStage::ProjectEntry => self.write_project_entry(source, target),
        }
    }

    // ==================== Stages ====================

    fn copy_elements(&self, source: &ProjectKey, target: &ProjectKey) -> Result<(), MigrationError> {
        let source_bytes = self
            .source
            .documents()
            .project_bytes(self.source.namespace(), source)?
            .unwrap_or_default();

        let mut doc = self
            .target
            .documents()
            .load_project(self.target.namespace(), target)?
            .unwrap_or_default();

        if source_bytes.is_empty() || ProjectDocument::load(&source_bytes)?.is_empty() {
            warn!(project = %source, bytes = source_bytes.len(), "Source project has no elements");
        }
        if !source_bytes.is_empty() {
            doc.apply_update(&source_bytes)?;
        }

        self.target
            .documents()
            .save_project(self.target.namespace(), target, &mut doc)?;
        Ok(())
    }

    fn copy_documents(&self, source: &ProjectKey, target: &ProjectKey) -> Result<(), MigrationError> {
        if source == target {
            // Content documents are keyed without a namespace, so an unchanged
            // key already refers to the same records.
            return Ok(());
        }

        let Some(structure) = self
            .source
            .documents()
            .load_project(self.source.namespace(), source)?
        else {
            return Ok(());
        };

        let mut copied = 0;
        for element in structure.content_elements()? {
            let bytes = match self.source.documents().content_bytes(source, &element.id)? {
                Some(bytes) if !bytes.is_empty() => bytes,
                _ => continue,
            };

            let mut doc = self
                .target
                .documents()
                .load_content(target, &element.id)?
                .unwrap_or_else(ContentDocument::new);
            doc.apply_update(&bytes)?;
            self.target
                .documents()
                .save_content(target, &element.id, &mut doc)?;
            copied += 1;
        }

        info!(project = %source, documents = copied, "Copied content documents");
        Ok(())
    }

    fn copy_media(&self, source: &ProjectKey, target: &ProjectKey) -> Result<(), MigrationError> {
        let records = self.source.media().list(source)?;
        for record in &records {
            self.target.media().put(target, record)?;
            if !self.target.context().is_local() {
                self.target.sync_state().mark_pending_upload(target, &record.id)?;
            }
        }
        info!(project = %source, media = records.len(), "Copied media");
        Ok(())
    }

    fn write_project_entry(&self, source: &ProjectKey, target: &ProjectKey) -> Result<(), MigrationError> {
        let original = self
            .source
            .get_project(source)?
            .ok_or_else(|| MigrationError::ProjectNotFound(source.clone()))?;

        let mut record = original.clone();
        record.key = target.clone();
        record.remote_id = None;
        record.updated_at = Utc::now();
        self.target.put_project(&record)?;

        let migration = MigrationRecord {
            original_key: source.clone(),
            migrated_key: target.clone(),
            target_endpoint: self.target.context().endpoint_label().to_string(),
            migrated_username: target.owner.clone(),
            migrated_at: Utc::now(),
        };
        put_json(
            self.source.kv().as_ref(),
            self.source.namespace(),
            &self.record_key(source),
            &migration,
        )?;

        if !self.target.context().is_local() {
            self.target.sync_state().mark_pending_creation(
                target,
                PendingCreation::new(record.draft(), record.template_id.clone()),
            )?;
        }
        Ok(())
    }

    // ==================== Helpers ====================

    /// Validate a request and pair each source project with its target key
    fn plan(&self, request: &MigrationRequest) -> Result<Vec<(ProjectKey, ProjectKey)>, MigrationError> {
        validate_owner(&request.target_owner)
            .map_err(|e| MigrationError::Validation(e.to_string()))?;
        if self.source.namespace() == self.target.namespace() {
            return Err(MigrationError::Validation(
                "source and target are the same storage context".to_string(),
            ));
        }

        let sources: Vec<ProjectKey> = match request.projects {
            Some(ref explicit) => {
                for key in explicit {
                    if self.source.get_project(key)?.is_none() {
                        return Err(MigrationError::ProjectNotFound(key.clone()));
                    }
                }
                explicit.clone()
            }
            None => self.eligible_projects()?.into_iter().map(|p| p.key).collect(),
        };

        let mut plan = Vec::with_capacity(sources.len());
        for source in sources {
            let target = self.target_key(&source, request)?;
            if plan.iter().any(|(_, t)| t == &target) {
                return Err(MigrationError::Validation(format!(
                    "two projects would migrate to {}",
                    target
                )));
            }
            plan.push((source, target));
        }
        Ok(plan)
    }

    fn record_prefix(&self) -> String {
        format!("{}{}:", MIGRATION_PREFIX, self.target.context().id)
    }

    fn record_key(&self, key: &ProjectKey) -> String {
        format!("{}{}", self.record_prefix(), key.storage_id())
    }
}
