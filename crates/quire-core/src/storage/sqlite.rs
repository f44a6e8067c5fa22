//! SQLite-backed record store
//!
//! One database file holds every namespace. Writes are single statements, so
//! a crash leaves each record either fully old or fully new.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::kv::{KvStore, Namespace};
use super::schema::{init_schema, needs_init};

/// Persistent `KvStore` implementation
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteKvStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;

        if needs_init(&conn) {
            init_schema(&conn)?;
        }

        debug!("Opened record store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Path of the database file, if on disk
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Total number of stored records
    pub fn record_count(&self) -> StorageResult<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?)
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

impl KvStore for SqliteKvStore {
    fn get(&self, ns: &Namespace, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM records WHERE key = ?1",
                params![ns.compose(key)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, ns: &Namespace, key: &str, value: &[u8]) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO records (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![ns.compose(key), value, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    fn delete(&self, ns: &Namespace, key: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM records WHERE key = ?1", params![ns.compose(key)])?;
        Ok(())
    }

    fn scan_prefix(&self, ns: &Namespace, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let strip = ns.prefix().chars().count();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM records WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;

        let rows = stmt.query_map(params![ns.compose(prefix)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (key, value) = row?;
            records.push((key.chars().skip(strip).collect(), value));
        }
        Ok(records)
    }

    fn delete_prefix(&self, ns: &Namespace, prefix: &str) -> StorageResult<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM records WHERE substr(key, 1, length(?1)) = ?1",
            params![ns.compose(prefix)],
        )?;
        Ok(removed)
    }
}
