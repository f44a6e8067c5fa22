//! Error types for the document server

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A document name that does not decompose into `{kind}:{owner}:{slug}:{suffix}`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentNameError {
    #[error("Document name is empty")]
    Empty,

    #[error("Document name '{0}' must have the form kind:owner:slug:suffix")]
    WrongShape(String),

    #[error("Unknown document kind '{0}'")]
    UnknownKind(String),

    #[error("Invalid owner in document name: {0}")]
    InvalidOwner(String),

    #[error("Invalid project slug in document name: {0}")]
    InvalidSlug(String),

    #[error("Invalid document suffix '{0}'")]
    InvalidSuffix(String),
}

/// Errors raised while binding documents to their project stores
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error(transparent)]
    InvalidDocumentName(#[from] DocumentNameError),

    #[error("Document '{document}' is owned by another user")]
    OwnershipViolation { document: String, owner: String },

    #[error("Store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Failed to prepare store directory {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("Stored updates for '{document}' could not be applied: {source}")]
    Document {
        document: String,
        #[source]
        source: automerge::AutomergeError,
    },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
