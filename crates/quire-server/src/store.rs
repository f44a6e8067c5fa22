//! Per-project embedded stores
//!
//! Each project gets its own SQLite file at `{data_dir}/{owner}/{slug}/store.db`
//! holding two tables:
//!
//! - `owners`: first-writer-wins owner of each document name
//! - `updates`: append-only log of encoded Automerge updates per document
//!
//! Stores are never shared between projects, so no lock spans two projects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::{PersistenceError, PersistenceResult};
use crate::name::DocumentName;

const STORE_FILE: &str = "store.db";

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS owners (
            doc_name TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            claimed_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS updates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_name TEXT NOT NULL,
            data BLOB NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_updates_doc ON updates(doc_name, id);
        "#,
    )
}

/// The embedded store of one project
pub struct ProjectStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl ProjectStore {
    /// Open or create the store in `dir`
    pub fn open(dir: &Path) -> PersistenceResult<Self> {
        std::fs::create_dir_all(dir).map_err(|source| PersistenceError::Io {
            source,
            path: dir.to_path_buf(),
        })?;

        let path = dir.join(STORE_FILE);
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        init_schema(&conn)?;

        debug!("Opened project store at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> PersistenceResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ==================== Ownership ====================

    /// Claim a document for `identity` unless someone already owns it
    ///
    /// Returns the owner after the claim, which is `identity` only if this was
    /// the first claim or `identity` already owned the document.
    pub fn claim_owner(&self, doc_name: &str, identity: &str) -> PersistenceResult<String> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO owners (doc_name, owner_id, claimed_at) VALUES (?1, ?2, ?3)",
            params![doc_name, identity, Utc::now().timestamp_millis()],
        )?;
        let owner = conn.query_row(
            "SELECT owner_id FROM owners WHERE doc_name = ?1",
            params![doc_name],
            |row| row.get(0),
        )?;
        Ok(owner)
    }

    pub fn owner(&self, doc_name: &str) -> PersistenceResult<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT owner_id FROM owners WHERE doc_name = ?1",
                params![doc_name],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ==================== Update log ====================

    pub fn append_update(&self, doc_name: &str, data: &[u8]) -> PersistenceResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO updates (doc_name, data, created_at) VALUES (?1, ?2, ?3)",
            params![doc_name, data, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// All updates of a document in append order
    pub fn load_updates(&self, doc_name: &str) -> PersistenceResult<Vec<Vec<u8>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT data FROM updates WHERE doc_name = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![doc_name], |row| row.get::<_, Vec<u8>>(0))?;

        let mut updates = Vec::new();
        for row in rows {
            updates.push(row?);
        }
        Ok(updates)
    }

    /// Replace a document's whole log with a single full snapshot
    pub fn replace_updates(&self, doc_name: &str, snapshot: &[u8]) -> PersistenceResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM updates WHERE doc_name = ?1", params![doc_name])?;
        tx.execute(
            "INSERT INTO updates (doc_name, data, created_at) VALUES (?1, ?2, ?3)",
            params![doc_name, snapshot, Utc::now().timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn update_count(&self, doc_name: &str) -> PersistenceResult<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM updates WHERE doc_name = ?1",
            params![doc_name],
            |row| row.get(0),
        )?)
    }

    fn conn(&self) -> PersistenceResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PersistenceError::LockPoisoned)
    }
}

/// Opens project stores on demand and keeps them open until released
pub struct StoreRegistry {
    data_dir: PathBuf,
    stores: Mutex<HashMap<(String, String), Arc<ProjectStore>>>,
}

impl StoreRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The store of the project a document belongs to
    pub fn store_for(&self, name: &DocumentName) -> PersistenceResult<Arc<ProjectStore>> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned)?;

        if let Some(store) = stores.get(&name.project()) {
            return Ok(store.clone());
        }

        let store = Arc::new(ProjectStore::open(&name.store_dir(&self.data_dir))?);
        stores.insert(name.project(), store.clone());
        Ok(store)
    }

    /// Drop the cached store of the project `name` belongs to
    ///
    /// Handles already given out stay usable; the next `store_for` opens the
    /// file again.
    pub fn release(&self, name: &DocumentName) {
        match self.stores.lock() {
            Ok(mut stores) => {
                if stores.remove(&name.project()).is_some() {
                    debug!(owner = %name.owner, slug = %name.slug, "Released project store");
                }
            }
            Err(_) => warn!("Store registry lock poisoned, keeping store open"),
        }
    }

    /// Number of stores currently open
    pub fn open_count(&self) -> usize {
        self.stores.lock().map(|s| s.len()).unwrap_or(0)
    }
}
