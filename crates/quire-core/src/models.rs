//! Data models for Quire
//!
//! Defines the records shared by the sync, tombstone and migration layers:
//! project identities, project metadata, pending-change payloads, tombstones
//! and migration records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing or validating model values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Invalid project key '{0}': expected 'owner/slug'")]
    InvalidProjectKey(String),

    #[error("Invalid slug '{0}': use lower-case letters, digits and '-'")]
    InvalidSlug(String),

    #[error("Invalid owner name '{0}'")]
    InvalidOwner(String),
}

/// Identity of a project within a namespace: owner plus slug
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey {
    pub owner: String,
    pub slug: String,
}

impl ProjectKey {
    /// Create a validated project key
    pub fn new(owner: impl Into<String>, slug: impl Into<String>) -> Result<Self, ModelError> {
        let owner = owner.into();
        let slug = slug.into();
        validate_owner(&owner)?;
        validate_slug(&slug)?;
        Ok(Self { owner, slug })
    }

    /// Parse the `owner/slug` form
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        let (owner, slug) = s
            .split_once('/')
            .ok_or_else(|| ModelError::InvalidProjectKey(s.to_string()))?;
        Self::new(owner, slug).map_err(|_| ModelError::InvalidProjectKey(s.to_string()))
    }

    /// Colon-joined form used inside storage keys: `owner:slug`
    pub fn storage_id(&self) -> String {
        format!("{}:{}", self.owner, self.slug)
    }

    /// Same slug under a different owner
    pub fn with_owner(&self, owner: &str) -> Result<Self, ModelError> {
        Self::new(owner, self.slug.clone())
    }

    /// Same owner with a different slug
    pub fn with_slug(&self, slug: &str) -> Result<Self, ModelError> {
        Self::new(self.owner.clone(), slug)
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.slug)
    }
}

impl FromStr for ProjectKey {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Slugs that would shadow record prefixes when joined onto an owner
///
/// Element content documents are stored as `owner:slug:element` without a
/// namespace prefix, so an owner named like a namespace (`local`, `ctx`) plus
/// one of these slugs would land inside that namespace's record space.
const RESERVED_SLUGS: &[&str] = &[
    "auth",
    "descriptor",
    "doc",
    "media",
    "migration",
    "project",
    "sync",
    "tombstone",
];

/// Validate a project slug
pub fn validate_slug(slug: &str) -> Result<(), ModelError> {
    let valid = !slug.is_empty()
        && !RESERVED_SLUGS.contains(&slug)
        && slug.len() <= 64
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ModelError::InvalidSlug(slug.to_string()))
    }
}

/// Validate an owner (user) name
pub fn validate_owner(owner: &str) -> Result<(), ModelError> {
    let valid = !owner.is_empty()
        && owner.len() <= 64
        && owner
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid && owner != "." && owner != ".." {
        Ok(())
    } else {
        Err(ModelError::InvalidOwner(owner.to_string()))
    }
}

/// Project metadata as stored in a namespace's project list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRecord {
    pub key: ProjectKey,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cover_media_id: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    /// Server-assigned identity, once the remote authority knows the project
    #[serde(default)]
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(key: ProjectKey, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key,
            title: title.into(),
            description: None,
            cover_media_id: None,
            template_id: None,
            remote_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a metadata patch locally
    pub fn apply_patch(&mut self, patch: &MetadataPatch) {
        if let Some(ref title) = patch.title {
            self.title = title.clone();
        }
        if let Some(ref description) = patch.description {
            self.description = Some(description.clone());
        }
        if let Some(ref cover) = patch.cover_media_id {
            self.cover_media_id = Some(cover.clone());
        }
        self.updated_at = Utc::now();
    }

    /// Draft fields describing this project for remote creation
    pub fn draft(&self) -> ProjectDraft {
        ProjectDraft {
            title: self.title.clone(),
            description: self.description.clone(),
        }
    }
}

/// Fields supplied when a project is first created
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Metadata fields edited locally and not yet confirmed remotely
///
/// Each field is independent: `None` means "untouched", so merging two
/// patches keeps the latest value per field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_media_id: Option<String>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none() && self.cover_media_id.is_none()
    }

    /// Merge `newer` into this patch; fields set in `newer` win
    pub fn merge(&mut self, newer: &MetadataPatch) {
        if newer.title.is_some() {
            self.title = newer.title.clone();
        }
        if newer.description.is_some() {
            self.description = newer.description.clone();
        }
        if newer.cover_media_id.is_some() {
            self.cover_media_id = newer.cover_media_id.clone();
        }
    }

    /// Fields of this patch whose value differs from the given current state
    pub fn changes_against(
        &self,
        title: &str,
        description: Option<&str>,
        cover_media_id: Option<&str>,
    ) -> MetadataPatch {
        MetadataPatch {
            title: self.title.clone().filter(|t| t != title),
            description: self
                .description
                .clone()
                .filter(|d| Some(d.as_str()) != description),
            cover_media_id: self
                .cover_media_id
                .clone()
                .filter(|c| Some(c.as_str()) != cover_media_id),
        }
    }
}

/// The single pending-creation slot of a project
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingCreation {
    pub draft: ProjectDraft,
    #[serde(default)]
    pub template_id: Option<String>,
    pub queued_at: DateTime<Utc>,
}

impl PendingCreation {
    pub fn new(draft: ProjectDraft, template_id: Option<String>) -> Self {
        Self {
            draft,
            template_id,
            queued_at: Utc::now(),
        }
    }
}

/// Durable deletion marker for a project identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tombstone {
    pub key: ProjectKey,
    pub deleted_at: DateTime<Utc>,
}

/// Record of one project copied into another storage context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRecord {
    pub original_key: ProjectKey,
    pub migrated_key: ProjectKey,
    pub target_endpoint: String,
    pub migrated_username: String,
    pub migrated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_key_parse_and_display() {
        let key = ProjectKey::parse("alice/my-novel").unwrap();
        assert_eq!(key.owner, "alice");
        assert_eq!(key.slug, "my-novel");
        assert_eq!(key.to_string(), "alice/my-novel");
        assert_eq!(key.storage_id(), "alice:my-novel");

        let parsed: ProjectKey = "bob/notes".parse().unwrap();
        assert_eq!(parsed.owner, "bob");
    }

    #[test]
    fn test_project_key_rejects_malformed() {
        assert!(ProjectKey::parse("no-slash").is_err());
        assert!(ProjectKey::parse("/slug").is_err());
        assert!(ProjectKey::parse("alice/").is_err());
        assert!(ProjectKey::parse("alice/Upper").is_err());
        assert!(ProjectKey::parse("alice/has:colon").is_err());
        assert!(ProjectKey::parse("../slug").is_err());
    }

    #[test]
    fn test_slug_validation() {
        assert!(validate_slug("my-novel-2").is_ok());
        assert!(validate_slug("-leading").is_err());
        assert!(validate_slug("trailing-").is_err());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("with space").is_err());
        assert!(validate_slug("project").is_err());
        assert!(validate_slug("projects").is_ok());
    }

    #[test]
    fn test_metadata_patch_merge_last_write_wins() {
        let mut pending = MetadataPatch {
            title: Some("First".to_string()),
            description: Some("Keep me".to_string()),
            cover_media_id: None,
        };
        pending.merge(&MetadataPatch {
            title: Some("Second".to_string()),
            ..Default::default()
        });

        assert_eq!(pending.title.as_deref(), Some("Second"));
        assert_eq!(pending.description.as_deref(), Some("Keep me"));
        assert!(pending.cover_media_id.is_none());
    }

    #[test]
    fn test_metadata_patch_changes_against_current() {
        let patch = MetadataPatch {
            title: Some("Same".to_string()),
            description: Some("New".to_string()),
            cover_media_id: None,
        };

        let changes = patch.changes_against("Same", Some("Old"), None);
        assert!(changes.title.is_none());
        assert_eq!(changes.description.as_deref(), Some("New"));

        let nothing = patch.changes_against("Same", Some("New"), None);
        assert!(nothing.is_empty());
    }

    #[test]
    fn test_record_apply_patch() {
        let key = ProjectKey::new("alice", "novel").unwrap();
        let mut record = ProjectRecord::new(key, "Draft");
        record.apply_patch(&MetadataPatch {
            description: Some("A story".to_string()),
            ..Default::default()
        });

        assert_eq!(record.title, "Draft");
        assert_eq!(record.description.as_deref(), Some("A story"));
    }

    #[test]
    fn test_metadata_patch_skips_untouched_fields() {
        let patch = MetadataPatch {
            title: Some("Only title".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&patch).unwrap();
        assert_eq!(json, r#"{"title":"Only title"}"#);
    }
}
