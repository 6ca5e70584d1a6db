//! Cache-first reads.
//!
//! [`CachedQuery`] serves the last stored result for a `(query, args)` pair
//! immediately and swaps in live server data when it arrives, writing it back
//! under `cache.<operation>.<argsHash>`.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    config::QueryConfig,
    persist::{CACHE_PREFIX, DurableCache},
    remote::RemoteQuery,
    types::{NetworkStatus, TableName, TimestampMs, now_ms},
};

/// Stored query result plus its capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// Result payload.
    pub data: T,
    /// Capture time in milliseconds.
    pub timestamp: TimestampMs,
}

/// Query-result namespace of the durable cache.
///
/// Read and write failures are logged and otherwise ignored: losing a cache
/// entry only costs a refetch.
#[derive(Clone)]
pub struct QueryCache {
    cache: Arc<dyn DurableCache>,
}

impl QueryCache {
    /// Query namespace over `cache`.
    pub fn new(cache: Arc<dyn DurableCache>) -> Self {
        Self { cache }
    }

    /// Deterministic key for a query and its arguments. Object key order in
    /// `args` does not matter.
    pub fn key_for(operation: &str, args: &Value) -> String {
        let mut canonical = String::new();
        write_canonical(args, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{CACHE_PREFIX}{operation}.{}", hex::encode(&digest[..8]))
    }

    /// Key prefix shared by every query of `table`.
    pub fn table_prefix(table: TableName) -> String {
        format!("{CACHE_PREFIX}{}.", table.as_str())
    }

    /// Cached entry under `key`. Unreadable entries count as misses.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        match self.cache.get_json::<CacheEntry<T>>(key) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key, error = %err, "unreadable cache entry");
                None
            }
        }
    }

    /// Stores `data` under `key` stamped with `timestamp`.
    pub fn write<T: Serialize>(&self, key: &str, data: &T, timestamp: TimestampMs) {
        let entry = CacheEntry { data, timestamp };
        if let Err(err) = self.cache.put_json(key, &entry) {
            warn!(key, error = %err, "cache write failed");
        }
    }

    /// Removes one entry.
    pub fn remove(&self, key: &str) -> bool {
        self.cache.remove(key).unwrap_or_else(|err| {
            warn!(key, error = %err, "cache remove failed");
            false
        })
    }

    /// Drops every cached query of `table`. Coarse on purpose: a write can
    /// affect any query over its table.
    pub fn invalidate_table(&self, table: TableName) -> usize {
        let prefix = Self::table_prefix(table);
        match self.cache.remove_prefix(&prefix) {
            Ok(count) => {
                debug!(%table, count, "invalidated cached queries");
                count
            }
            Err(err) => {
                warn!(%table, error = %err, "cache invalidation failed");
                0
            }
        }
    }

    /// [`invalidate_table`](Self::invalidate_table) on the blocking pool, for
    /// callers on an async worker.
    pub async fn invalidate_table_async(&self, table: TableName) -> usize {
        let queries = self.clone();
        tokio::task::spawn_blocking(move || queries.invalidate_table(table))
            .await
            .unwrap_or_else(|err| {
                warn!(%table, error = %err, "cache invalidation task failed");
                0
            })
    }

    /// Drops the whole query namespace.
    pub fn clear(&self) -> usize {
        self.cache.remove_prefix(CACHE_PREFIX).unwrap_or_else(|err| {
            warn!(error = %err, "cache clear failed");
            0
        })
    }

    /// Every cached query key.
    pub fn keys(&self) -> Vec<String> {
        self.cache.keys_with_prefix(CACHE_PREFIX).unwrap_or_default()
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Arguments for a cached query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryArgs {
    /// Run the query with these arguments.
    Args(Value),
    /// Do not run the query at all (arguments not ready yet).
    Skip,
}

/// Per-query behaviour.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Serve cached data only; never subscribe to the server.
    pub cache_only: bool,
    /// Age after which cache-sourced data is reported stale.
    pub stale_time: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions::from(&QueryConfig::default())
    }
}

impl From<&QueryConfig> for QueryOptions {
    fn from(config: &QueryConfig) -> Self {
        Self {
            cache_only: false,
            stale_time: Duration::from_millis(config.stale_time_ms),
        }
    }
}

/// What the UI binding renders.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    /// Last known result.
    pub data: Option<T>,
    /// No data yet and the query is not skipped.
    pub is_loading: bool,
    /// `data` came from the durable cache.
    pub is_from_cache: bool,
    /// Cached data is older than the stale time.
    pub is_stale: bool,
    /// The network is offline.
    pub is_offline: bool,
}

/// Cache-first read adapter for one `(query, args)` pair.
pub struct CachedQuery<Q: RemoteQuery> {
    query: Arc<Q>,
    args: QueryArgs,
    key: Option<String>,
    cache: QueryCache,
    network: watch::Receiver<NetworkStatus>,
    options: QueryOptions,
    data: Option<Q::Output>,
    captured_at: Option<TimestampMs>,
    from_cache: bool,
}

impl<Q: RemoteQuery> CachedQuery<Q> {
    /// Mounts the query, loading any existing cache entry synchronously.
    pub fn mount(
        query: Arc<Q>,
        args: QueryArgs,
        cache: QueryCache,
        network: watch::Receiver<NetworkStatus>,
        options: QueryOptions,
    ) -> Self {
        let key = match &args {
            QueryArgs::Args(value) => Some(QueryCache::key_for(query.name(), value)),
            QueryArgs::Skip => None,
        };
        let cached = key
            .as_deref()
            .and_then(|k| cache.read::<Q::Output>(k));

        let (data, captured_at, from_cache) = match cached {
            Some(entry) => (Some(entry.data), Some(entry.timestamp), true),
            None => (None, None, false),
        };

        Self {
            query,
            args,
            key,
            cache,
            network,
            options,
            data,
            captured_at,
            from_cache,
        }
    }

    /// Cache key, or `None` when skipped.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// State as of now.
    pub fn state(&self) -> QueryState<Q::Output> {
        self.state_at(now_ms())
    }

    /// State as seen at `now`; staleness is relative to it.
    pub fn state_at(&self, now: TimestampMs) -> QueryState<Q::Output> {
        let is_stale = match (self.from_cache, self.captured_at) {
            (true, Some(ts)) => now.saturating_sub(ts) > self.options.stale_time.as_millis() as u64,
            _ => false,
        };
        QueryState {
            data: self.data.clone(),
            is_loading: self.data.is_none() && self.args != QueryArgs::Skip,
            is_from_cache: self.from_cache,
            is_stale,
            is_offline: self.is_offline(),
        }
    }

    /// True when the network is known to be offline.
    pub fn is_offline(&self) -> bool {
        *self.network.borrow() == NetworkStatus::Offline
    }

    /// Whether a live read should be running right now.
    pub fn wants_live(&self) -> bool {
        !self.options.cache_only && self.key.is_some() && !self.is_offline()
    }

    /// Performs one live read when allowed. A failed read leaves the cached
    /// data in place. Returns whether fresh data was applied.
    pub async fn sync_live(&mut self) -> bool {
        if !self.wants_live() {
            return false;
        }
        let QueryArgs::Args(args) = &self.args else {
            return false;
        };

        match self.query.fetch(args).await {
            Ok(value) => {
                self.apply_live(value);
                true
            }
            Err(err) => {
                debug!(query = self.query.name(), error = %err, "live read failed; keeping cached data");
                false
            }
        }
    }

    /// Accepts a value pushed by a live subscription as authoritative.
    pub fn apply_live(&mut self, value: Q::Output) {
        let now = now_ms();
        if let Some(key) = &self.key {
            self.cache.write(key, &value, now);
        }
        self.data = Some(value);
        self.captured_at = Some(now);
        self.from_cache = false;
    }

    /// Clears this query's cache entry and lets the next live read
    /// repopulate it. Offline this leaves the query empty.
    pub async fn refetch(&mut self) -> bool {
        if let Some(key) = &self.key {
            self.cache.remove(key);
        }
        if self.from_cache {
            self.data = None;
            self.captured_at = None;
            self.from_cache = false;
        }
        self.sync_live().await
    }
}
