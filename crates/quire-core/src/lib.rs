//! Quire Core Library
//!
//! This crate provides the client side of Quire, a local-first writing
//! tool: projects are edited offline against a local record store and
//! reconciled with a server whenever one is reachable.
//!
//! # Architecture
//!
//! - **Storage contexts**: every server endpoint (and the local-only mode)
//!   gets its own record namespace, so switching servers never mixes data
//! - **Automerge**: project structure and document bodies are CRDTs, so a
//!   migration or a reconnect merges instead of overwriting
//! - **Reconciler**: a background pass that replays tombstones, pending
//!   creations and metadata edits once connectivity returns
//!
//! # Quick Start
//!
//! ```text
//! let kv = Arc::new(SqliteKvStore::open(&config.database_path())?);
//! let registry = ContextRegistry::open(kv.clone())?;
//! let workspace = Workspace::open(kv, registry.active_handle());
//!
//! let key = ProjectKey::new("local", "my-novel")?;
//! let draft = ProjectDraft { title: "My Novel".into(), description: None };
//! workspace.create_project(&key, draft, None)?;
//! ```
//!
//! # Modules
//!
//! - `context`: storage contexts, namespaces and the active-context pointer
//! - `workspace`: project operations scoped to one context (main entry point)
//! - `sync_state`: per-project pending-change bookkeeping
//! - `tombstone`: deletion markers that keep deleted projects deleted
//! - `migration`: copy projects from one context into another
//! - `reconcile`: connectivity-driven background sync
//! - `remote`: HTTP client for the server's project API
//! - `document`: Automerge project and content documents
//! - `media`: binary attachments
//! - `storage`: namespaced record persistence
//! - `config`: application configuration

pub mod config;
pub mod context;
pub mod document;
pub mod media;
pub mod migration;
pub mod models;
pub mod reconcile;
pub mod remote;
pub mod storage;
pub mod sync_state;
pub mod tombstone;
pub mod workspace;

pub use config::Config;
pub use context::{
    normalize_endpoint, ContextError, ContextHandle, ContextId, ContextRegistry,
    StorageContextDescriptor, TokenStore,
};
pub use document::{ContentDocument, DocumentError, DocumentStore, Element, ElementKind, ProjectDocument};
pub use media::{MediaRecord, MediaStore};
pub use migration::{MigrationEngine, MigrationError, MigrationReport, MigrationRequest, MigrationStage};
pub use models::{MetadataPatch, ModelError, ProjectDraft, ProjectKey, ProjectRecord, Tombstone};
pub use reconcile::{Connectivity, ConnectivityMonitor, PassReport, Reconciler};
pub use remote::{HttpProjectApi, RemoteError, RemoteProject, RemoteProjectApi};
pub use storage::{KvStore, MemoryKvStore, Namespace, SqliteKvStore, StorageError};
pub use sync_state::{SyncStateStore, SyncStatus};
pub use tombstone::TombstoneRegistry;
pub use workspace::{DeleteOptions, Workspace};
