//! SQLite-backed durable key/value cache.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};

use crate::types::now_ms;

use super::{DurableCache, PersistError, PersistResult};

/// SQLite implementation of [`crate::persist::DurableCache`].
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Opens or creates a SQLite-backed cache at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite cache.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> PersistResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PersistError::Message("sqlite connection lock poisoned".to_string()))
    }
}

impl DurableCache for SqliteCache {
    fn get(&self, key: &str) -> PersistResult<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, value: &[u8]) -> PersistResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv(key, value, updated_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_ms = excluded.updated_ms",
            params![key, value, now_ms() as i64],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> PersistResult<bool> {
        let conn = self.lock()?;
        let count = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(count > 0)
    }

    fn remove_prefix(&self, prefix: &str) -> PersistResult<usize> {
        let conn = self.lock()?;
        // substr() instead of LIKE so '_' and '%' in keys match literally.
        let count = conn.execute(
            "DELETE FROM kv WHERE substr(key, 1, ?1) = ?2",
            params![prefix.chars().count() as i64, prefix],
        )?;
        Ok(count)
    }

    fn keys_with_prefix(&self, prefix: &str) -> PersistResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT key FROM kv WHERE substr(key, 1, ?1) = ?2 ORDER BY key ASC")?;
        let rows = stmt.query_map(params![prefix.chars().count() as i64, prefix], |row| {
            row.get::<_, String>(0)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn flush(&self) -> PersistResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}
