//! SQLite-backed cache store shared across processes.
//!
//! One row per key; writes are `INSERT OR REPLACE`, so each key is updated
//! atomically. Entries are stored as JSON.

use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{CacheBackend, CacheEntry};
use crate::error::CacheError;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::Unavailable(format!("create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.busy_timeout(std::time::Duration::from_secs(2))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "Opened cache store");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS search_cache (
                 key TEXT PRIMARY KEY,
                 entry TEXT NOT NULL,
                 expires_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_search_cache_expires ON search_cache(expires_at);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Delete every expired row. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now().timestamp_millis();
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM search_cache WHERE expires_at <= ?1", params![now])?;
        if removed > 0 {
            tracing::debug!(removed, "Purged expired cache rows");
        }
        Ok(removed)
    }
}

impl CacheBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT entry FROM search_cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let json = serde_json::to_string(entry)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO search_cache (key, entry, expires_at) VALUES (?1, ?2, ?3)",
            params![key, json, entry.expires_at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.conn
            .lock()
            .execute("DELETE FROM search_cache WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.conn.lock().execute("DELETE FROM search_cache", [])?;
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM search_cache", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}
