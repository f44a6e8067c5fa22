//! Quire document server
//!
//! Serves project documents over WebSocket connections and keeps each
//! project's documents in its own embedded store.
//!
//! # Modules
//!
//! - `server`: WebSocket endpoint, handshake checks and the sync loop
//! - `persistence`: binding live documents to project stores (ownership,
//!   update log, snapshots)
//! - `room`: live documents shared by concurrent connections
//! - `store`: per-project SQLite stores
//! - `name`: strict document name parsing
//! - `auth`: session credentials and origin allow-list
//! - `config`: server configuration

pub mod auth;
pub mod config;
pub mod error;
pub mod name;
pub mod persistence;
pub mod room;
pub mod server;
pub mod store;

pub use auth::{SessionAuthenticator, StaticSessions};
pub use config::ServerConfig;
pub use error::{DocumentNameError, PersistenceError};
pub use name::{DocumentKind, DocumentName};
pub use persistence::{DocumentPersistence, UpdateLog};
pub use server::{DocumentServer, CLOSE_INVALID_NAME, CLOSE_UNAUTHORIZED};
pub use store::{ProjectStore, StoreRegistry};
