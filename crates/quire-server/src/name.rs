//! Document names
//!
//! Every document served over the network is addressed as
//! `{kind}:{owner}:{slug}:{suffix}`. The owner and slug select the project
//! store; the full name identifies the document inside it.
//!
//! Parsing is strict. A name that does not decompose cleanly is rejected
//! rather than mapped onto some default project, since a fallback would merge
//! unrelated projects into one store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use quire_core::models::{validate_owner, validate_slug};

use crate::error::DocumentNameError;

/// What a document holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// The structural document listing a project's elements
    Project,
    /// Content of a document element
    Document,
    /// Content of a worldbuilding element
    Worldbuilding,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Project => "project",
            DocumentKind::Document => "document",
            DocumentKind::Worldbuilding => "worldbuilding",
        }
    }
}

impl FromStr for DocumentKind {
    type Err = DocumentNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(DocumentKind::Project),
            "document" => Ok(DocumentKind::Document),
            "worldbuilding" => Ok(DocumentKind::Worldbuilding),
            other => Err(DocumentNameError::UnknownKind(other.to_string())),
        }
    }
}

/// A parsed document name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentName {
    pub kind: DocumentKind,
    pub owner: String,
    pub slug: String,
    pub suffix: String,
}

impl DocumentName {
    /// Parse a name, failing on anything but the exact four-part form
    pub fn parse(raw: &str) -> Result<Self, DocumentNameError> {
        if raw.is_empty() {
            return Err(DocumentNameError::Empty);
        }

        let parts: Vec<&str> = raw.split(':').collect();
        let [kind, owner, slug, suffix] = parts.as_slice() else {
            return Err(DocumentNameError::WrongShape(raw.to_string()));
        };

        let kind = kind.parse::<DocumentKind>()?;
        validate_owner(owner).map_err(|e| DocumentNameError::InvalidOwner(e.to_string()))?;
        validate_slug(slug).map_err(|e| DocumentNameError::InvalidSlug(e.to_string()))?;
        validate_suffix(suffix)?;

        Ok(Self {
            kind,
            owner: owner.to_string(),
            slug: slug.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// Directory of the project store this document belongs to
    pub fn store_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(&self.owner).join(&self.slug)
    }

    /// `(owner, slug)` pair identifying the project store
    pub fn project(&self) -> (String, String) {
        (self.owner.clone(), self.slug.clone())
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.kind.as_str(),
            self.owner,
            self.slug,
            self.suffix
        )
    }
}

impl FromStr for DocumentName {
    type Err = DocumentNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn validate_suffix(suffix: &str) -> Result<(), DocumentNameError> {
    let valid = !suffix.is_empty()
        && suffix.len() <= 128
        && suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DocumentNameError::InvalidSuffix(suffix.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structural_name() {
        let name = DocumentName::parse("project:alice:my-novel:elements").unwrap();
        assert_eq!(name.kind, DocumentKind::Project);
        assert_eq!(name.owner, "alice");
        assert_eq!(name.slug, "my-novel");
        assert_eq!(name.suffix, "elements");
        assert_eq!(name.to_string(), "project:alice:my-novel:elements");
    }

    #[test]
    fn test_store_dir() {
        let name: DocumentName = "document:alice:my-novel:3f2a-91".parse().unwrap();
        assert_eq!(
            name.store_dir(Path::new("/srv/quire")),
            PathBuf::from("/srv/quire/alice/my-novel")
        );
    }

    #[test]
    fn test_rejects_malformed_names() {
        for raw in [
            "",
            "alice:my-novel",
            "project:alice:my-novel",
            "project:alice:my-novel:elements:extra",
            "project::my-novel:elements",
            "project:alice::elements",
            "project:alice:my-novel:",
            "chapter:alice:my-novel:elements",
            "project:../etc:my-novel:elements",
            "project:alice:My-Novel:elements",
            "project:alice:my-novel:a/b",
        ] {
            assert!(DocumentName::parse(raw).is_err(), "accepted {:?}", raw);
        }
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(DocumentName::parse(""), Err(DocumentNameError::Empty));
        assert!(matches!(
            DocumentName::parse("chapter:alice:novel:x"),
            Err(DocumentNameError::UnknownKind(_))
        ));
        assert!(matches!(
            DocumentName::parse("project:alice:novel"),
            Err(DocumentNameError::WrongShape(_))
        ));
    }
}
