//! Process-local cache used when no durable storage is wanted.

use std::sync::Mutex;

use hashbrown::HashMap;

use super::{DurableCache, PersistError, PersistResult};

/// In-process cache for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> R) -> PersistResult<R> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| PersistError::Message("memory cache lock poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}

impl DurableCache for MemoryCache {
    fn get(&self, key: &str) -> PersistResult<Option<Vec<u8>>> {
        self.with(|m| m.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> PersistResult<()> {
        self.with(|m| {
            m.insert(key.to_string(), value.to_vec());
        })
    }

    fn remove(&self, key: &str) -> PersistResult<bool> {
        self.with(|m| m.remove(key).is_some())
    }

    fn remove_prefix(&self, prefix: &str) -> PersistResult<usize> {
        self.with(|m| {
            let before = m.len();
            m.retain(|k, _| !k.starts_with(prefix));
            before - m.len()
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> PersistResult<Vec<String>> {
        self.with(|m| {
            let mut keys: Vec<String> = m.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
            keys.sort();
            keys
        })
    }
}
