//! Process-wide wiring of monitor, store, processor and query cache.

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    connectivity::{ConnectivityMonitor, NetworkProbe},
    dispatch::{MutationDispatcher, MutationHandle, MutationOptions},
    mutation::PendingMutation,
    persist::DurableCache,
    processor::SyncProcessor,
    query::{CachedQuery, QueryArgs, QueryCache, QueryOptions},
    remote::{OperationRegistry, RemoteMutation, RemoteQuery},
    types::{MutationId, NetworkStatus, SyncIndicator},
};

use super::handle::{RuntimeError, SyncStoreHandle, spawn_sync_store};

/// The running offline-sync subsystem.
///
/// Built once at startup with [`SyncService::start`] and torn down with
/// [`SyncService::shutdown`]. Everything UI-facing hangs off it.
pub struct SyncService {
    config: SyncConfig,
    store: SyncStoreHandle,
    monitor: ConnectivityMonitor,
    processor: Arc<SyncProcessor>,
    queries: QueryCache,
    bridge: JoinHandle<()>,
}

impl SyncService {
    /// Rehydrates the queue from `cache`, starts connectivity observation and
    /// the background processor.
    pub async fn start(
        cache: Arc<dyn DurableCache>,
        probe: Arc<dyn NetworkProbe>,
        registry: OperationRegistry,
        config: SyncConfig,
    ) -> Result<Self, RuntimeError> {
        let store = cache.load_sync_store()?;
        let restored = store.queue().len();
        let store = spawn_sync_store(store, Some(Arc::clone(&cache)), config.runtime.clone());
        let queries = QueryCache::new(cache);

        let monitor = ConnectivityMonitor::new(probe, config.monitor.clone());
        monitor.initialize().await;
        let mut network_rx = monitor.watch();
        let initial = *network_rx.borrow_and_update();
        store.set_network_status(initial).await?;
        let bridge = spawn_network_bridge(network_rx, store.clone());

        let processor = Arc::new(SyncProcessor::new(
            store.clone(),
            Arc::new(registry),
            queries.clone(),
            config.processor.clone(),
        ));
        processor.start();

        info!(restored, network = ?monitor.status(), "sync service started");
        Ok(Self {
            config,
            store,
            monitor,
            processor,
            queries,
            bridge,
        })
    }

    /// Handle to the sync store task.
    pub fn store(&self) -> &SyncStoreHandle {
        &self.store
    }

    /// Connectivity monitor.
    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Background sync processor.
    pub fn processor(&self) -> &Arc<SyncProcessor> {
        &self.processor
    }

    /// Query cache namespace.
    pub fn queries(&self) -> &QueryCache {
        &self.queries
    }

    /// Network status as seen by the store.
    pub fn network_status(&self) -> NetworkStatus {
        self.store.network_status()
    }

    /// Probes right away instead of waiting for the next platform event.
    pub async fn check_connection(&self) -> bool {
        self.monitor.check_connection().await
    }

    /// Mounts a cache-first query with the configured stale time.
    pub fn query<Q: RemoteQuery>(&self, query: Arc<Q>, args: QueryArgs) -> CachedQuery<Q> {
        self.query_with_options(query, args, QueryOptions::from(&self.config.query))
    }

    /// Mounts a cache-first query with explicit options.
    pub fn query_with_options<Q: RemoteQuery>(
        &self,
        query: Arc<Q>,
        args: QueryArgs,
        options: QueryOptions,
    ) -> CachedQuery<Q> {
        CachedQuery::mount(
            query,
            args,
            self.queries.clone(),
            self.store.network_watch(),
            options,
        )
    }

    /// Builds a dispatcher bound to this service.
    pub fn dispatcher(
        &self,
        remote: Arc<dyn RemoteMutation>,
        options: MutationOptions,
    ) -> Arc<MutationDispatcher> {
        Arc::new(MutationDispatcher::new(
            remote,
            options,
            self.store.clone(),
            self.queries.clone(),
        ))
    }

    /// Builds a stateful mutation handle.
    pub fn mutation(&self, remote: Arc<dyn RemoteMutation>, options: MutationOptions) -> MutationHandle {
        MutationHandle::new(self.dispatcher(remote, options))
    }

    /// Status shown to the user.
    pub async fn indicator(&self) -> Result<SyncIndicator, RuntimeError> {
        self.store.indicator().await
    }

    /// Number of records waiting to replay.
    pub async fn pending_count(&self) -> Result<usize, RuntimeError> {
        Ok(self.store.pending_mutations().await?.len())
    }

    /// Records waiting for the user.
    pub async fn failed_mutations(&self) -> Result<Vec<PendingMutation>, RuntimeError> {
        self.store.failed_mutations().await
    }

    /// User retry of a failed record.
    pub async fn retry_mutation(&self, id: MutationId) -> Result<(), RuntimeError> {
        self.store.retry_mutation(id).await
    }

    /// Drops a failed record.
    pub async fn discard_mutation(&self, id: MutationId) -> Result<(), RuntimeError> {
        self.store.discard_mutation(id).await
    }

    /// Retries every failed record.
    pub async fn retry_all_failed(&self) -> Result<usize, RuntimeError> {
        self.store.retry_all_failed().await
    }

    /// Stops background work and writes the final sync state.
    pub async fn shutdown(self) -> Result<(), RuntimeError> {
        self.processor.stop().await;
        self.bridge.abort();
        self.monitor.cleanup();
        self.store.shutdown().await?;
        info!("sync service stopped");
        Ok(())
    }
}

/// Mirrors settled monitor status into the store, which fans it out to the
/// processor and to query adapters.
fn spawn_network_bridge(mut rx: watch::Receiver<NetworkStatus>, store: SyncStoreHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = *rx.borrow_and_update();
            if let Err(err) = store.set_network_status(status).await {
                warn!(error = %err, "store gone; network bridge stopping");
                break;
            }
        }
        debug!("network bridge stopped");
    })
}
