/// In-memory backend.
pub mod memory;
/// SQLite backend.
pub mod sqlite;

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    core::store::SyncStore,
    mutation::{SNAPSHOT_FORMAT_VERSION, SyncSnapshot, SyncSnapshotEnvelope},
};

/// Key holding the serialized queue and per-table metadata.
pub const SYNC_STATE_KEY: &str = "sync.state";
/// Prefix of every query-result entry.
pub const CACHE_PREFIX: &str = "cache.";

/// Durable cache failure.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Storage engine error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Stored value could not be (de)serialized.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Snapshot written by an unknown format.
    #[error("unsupported snapshot format version {0}")]
    UnsupportedFormat(u16),
    /// Anything else, such as a worker join failure.
    #[error("{0}")]
    Message(String),
}

/// Result alias for cache operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Key/value substrate that survives process restarts.
///
/// Holds no business logic; everything stored here can be dropped and
/// repopulated.
pub trait DurableCache: Send + Sync {
    /// Raw bytes stored under `key`.
    fn get(&self, key: &str) -> PersistResult<Option<Vec<u8>>>;
    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> PersistResult<()>;
    /// Removes `key`. Returns whether it existed.
    fn remove(&self, key: &str) -> PersistResult<bool>;
    /// Removes every key starting with `prefix`. Returns the count.
    fn remove_prefix(&self, prefix: &str) -> PersistResult<usize>;
    /// Keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> PersistResult<Vec<String>>;
    /// Forces buffered writes to stable storage.
    fn flush(&self) -> PersistResult<()> {
        Ok(())
    }
}

impl dyn DurableCache {
    /// Reads and decodes a JSON value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> PersistResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encodes and writes a JSON value.
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> PersistResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, &bytes)
    }

    /// Writes the sync namespace.
    pub fn save_sync_state(&self, snapshot: &SyncSnapshot) -> PersistResult<()> {
        self.put_json(SYNC_STATE_KEY, &SyncSnapshotEnvelope::new(snapshot.clone()))
    }

    /// Reads the raw sync namespace without any rehydration rules applied.
    pub fn load_sync_snapshot(&self) -> PersistResult<Option<SyncSnapshot>> {
        let Some(env) = self.get_json::<SyncSnapshotEnvelope>(SYNC_STATE_KEY)? else {
            return Ok(None);
        };
        if env.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(PersistError::UnsupportedFormat(env.format_version));
        }
        Ok(Some(env.snapshot))
    }

    /// Rehydrates a [`SyncStore`]; an absent sync namespace yields an empty store.
    pub fn load_sync_store(&self) -> PersistResult<SyncStore> {
        Ok(self
            .load_sync_snapshot()?
            .map(SyncStore::from_snapshot)
            .unwrap_or_default())
    }
}
