//! Storage layer
//!
//! Handles client-local record persistence.
//!
//! ## Architecture
//!
//! - **KvStore**: get/put/delete/scan over `(Namespace, logical key)` pairs
//! - **SQLite**: durable backend, one `records` table for every namespace
//! - **Memory**: throwaway backend for tests
//!
//! Project lists, sync state, tombstones, media and documents are all stored
//! as records; the modules that own them choose the logical key layout.

pub mod error;
pub mod kv;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use kv::{get_json, put_json, scan_json, KvStore, Namespace};
pub use memory::MemoryKvStore;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
pub use sqlite::SqliteKvStore;
