use std::sync::Arc;

use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::RuntimeConfig,
    core::store::{StoreError, SyncStore},
    mutation::{EntitySyncMeta, MutationSpec, PendingMutation, SyncSnapshot},
    persist::{DurableCache, PersistError},
    types::{MutationId, NetworkStatus, Revision, SyncIndicator, SyncStatus, TableName},
};

use super::events::SyncEvent;

/// Failure talking to the store task.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The store rejected the transition.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Loading or saving state failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The store task is gone.
    #[error("sync store runtime has shut down")]
    ChannelClosed,
}

/// Cloneable handle to the single-writer task that owns the [`SyncStore`].
#[derive(Clone)]
pub struct SyncStoreHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<SyncEvent>,
    network_rx: watch::Receiver<NetworkStatus>,
}

enum Command {
    Queue {
        spec: MutationSpec,
        resp: oneshot::Sender<MutationId>,
    },
    MarkSyncing {
        id: MutationId,
        resp: oneshot::Sender<bool>,
    },
    Remove {
        id: MutationId,
        resp: oneshot::Sender<bool>,
    },
    MarkFailed {
        id: MutationId,
        error: String,
        resp: oneshot::Sender<bool>,
    },
    IncrementRetry {
        id: MutationId,
        error: String,
        resp: oneshot::Sender<bool>,
    },
    Retry {
        id: MutationId,
        resp: oneshot::Sender<Result<(), StoreError>>,
    },
    Discard {
        id: MutationId,
        resp: oneshot::Sender<Result<(), StoreError>>,
    },
    RetryAllFailed {
        resp: oneshot::Sender<usize>,
    },
    BumpEntitySync {
        table: TableName,
        resp: oneshot::Sender<EntitySyncMeta>,
    },
    SetNetwork {
        status: NetworkStatus,
        resp: oneshot::Sender<bool>,
    },
    BeginPass {
        resp: oneshot::Sender<()>,
    },
    FinishPass {
        resp: oneshot::Sender<SyncStatus>,
    },
    Get {
        id: MutationId,
        resp: oneshot::Sender<Option<PendingMutation>>,
    },
    Pending {
        resp: oneshot::Sender<Vec<PendingMutation>>,
    },
    Failed {
        resp: oneshot::Sender<Vec<PendingMutation>>,
    },
    Snapshot {
        resp: oneshot::Sender<SyncSnapshot>,
    },
    Indicator {
        resp: oneshot::Sender<SyncIndicator>,
    },
    Flush {
        resp: oneshot::Sender<Result<Revision, RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistMsg {
    Snapshot {
        snapshot: SyncSnapshot,
        urgent: bool,
    },
    Flush {
        resp: oneshot::Sender<Result<Revision, PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Spawns the store task. With `cache = None` nothing is persisted and every
/// revision is reported durable immediately.
pub fn spawn_sync_store(
    store: SyncStore,
    cache: Option<Arc<dyn DurableCache>>,
    config: RuntimeConfig,
) -> SyncStoreHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel::<SyncEvent>(1024);
    let (network_tx, network_rx) = watch::channel(store.network_status());

    let (persist_tx_opt, mut durable_rx) = if let Some(cache) = cache {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound.max(1));
        let (durable_tx, durable_rx) = mpsc::unbounded_channel::<Result<Revision, PersistError>>();
        spawn_persistence_worker(cache, persist_rx, durable_tx, config.clone());
        (Some(persist_tx), Some(durable_rx))
    } else {
        (None, None)
    };

    let events_tx_loop = events_tx.clone();

    tokio::spawn(async move {
        let mut store = store;
        let ctx = LoopCtx {
            events_tx: &events_tx_loop,
            network_tx: &network_tx,
            persist_tx: persist_tx_opt.as_ref(),
            flush_on_enqueue: config.flush_on_enqueue,
        };

        loop {
            if let Some(rx) = durable_rx.as_mut() {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break; };
                        if handle_command(cmd, &mut store, &ctx).await {
                            break;
                        }
                    }
                    durable = rx.recv() => {
                        match durable {
                            Some(Ok(revision)) => {
                                let _ = events_tx_loop.send(SyncEvent::DurableUpTo { revision });
                            }
                            Some(Err(err)) => warn!(error = %err, "sync state persistence failed"),
                            None => {}
                        }
                    }
                }
            } else {
                let Some(cmd) = cmd_rx.recv().await else { break; };
                if handle_command(cmd, &mut store, &ctx).await {
                    break;
                }
            }
        }
        debug!("sync store loop stopped");
    });

    SyncStoreHandle {
        cmd_tx,
        events_tx,
        network_rx,
    }
}

impl SyncStoreHandle {
    /// Receiver for store events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events_tx.subscribe()
    }

    /// Network status as last reported to the store.
    pub fn network_status(&self) -> NetworkStatus {
        *self.network_rx.borrow()
    }

    /// Receiver that tracks the stored network status.
    pub fn network_watch(&self) -> watch::Receiver<NetworkStatus> {
        self.network_rx.clone()
    }

    /// Appends a `pending` record; safe to call many times back-to-back.
    pub async fn queue_mutation(&self, spec: MutationSpec) -> Result<MutationId, RuntimeError> {
        self.request(|resp| Command::Queue { spec, resp }).await
    }

    /// `pending -> syncing`. False if the record is not pending.
    pub async fn mark_syncing(&self, id: MutationId) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::MarkSyncing { id, resp }).await
    }

    /// Drops a record after a successful replay.
    pub async fn remove_mutation(&self, id: MutationId) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::Remove { id, resp }).await
    }

    /// Moves a record to `failed`.
    pub async fn mark_failed(&self, id: MutationId, error: impl Into<String>) -> Result<bool, RuntimeError> {
        let error = error.into();
        self.request(|resp| Command::MarkFailed { id, error, resp }).await
    }

    /// Puts a record back to `pending` after a retryable failure.
    pub async fn increment_retry(
        &self,
        id: MutationId,
        error: impl Into<String>,
    ) -> Result<bool, RuntimeError> {
        let error = error.into();
        self.request(|resp| Command::IncrementRetry { id, error, resp })
            .await
    }

    /// User retry of a failed record.
    pub async fn retry_mutation(&self, id: MutationId) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Retry { id, resp }).await?
            .map_err(RuntimeError::from)
    }

    /// Drops a failed record for good.
    pub async fn discard_mutation(&self, id: MutationId) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Discard { id, resp }).await?
            .map_err(RuntimeError::from)
    }

    /// Retries every failed record. Returns the count.
    pub async fn retry_all_failed(&self) -> Result<usize, RuntimeError> {
        self.request(|resp| Command::RetryAllFailed { resp }).await
    }

    /// Records a successful sync for `table`.
    pub async fn bump_entity_sync(&self, table: TableName) -> Result<EntitySyncMeta, RuntimeError> {
        self.request(|resp| Command::BumpEntitySync { table, resp }).await
    }

    /// Records a connectivity change.
    pub async fn set_network_status(&self, status: NetworkStatus) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::SetNetwork { status, resp }).await
    }

    /// Marks a drain pass started.
    pub async fn begin_pass(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::BeginPass { resp }).await
    }

    /// Marks a drain pass finished and returns the settled status.
    pub async fn finish_pass(&self) -> Result<SyncStatus, RuntimeError> {
        self.request(|resp| Command::FinishPass { resp }).await
    }

    /// Record by id.
    pub async fn get(&self, id: MutationId) -> Result<Option<PendingMutation>, RuntimeError> {
        self.request(|resp| Command::Get { id, resp }).await
    }

    /// Pending records in replay order.
    pub async fn pending_mutations(&self) -> Result<Vec<PendingMutation>, RuntimeError> {
        self.request(|resp| Command::Pending { resp }).await
    }

    /// Records waiting for the user to retry or discard them.
    pub async fn failed_mutations(&self) -> Result<Vec<PendingMutation>, RuntimeError> {
        self.request(|resp| Command::Failed { resp }).await
    }

    /// Copy of the persistable state.
    pub async fn snapshot(&self) -> Result<SyncSnapshot, RuntimeError> {
        self.request(|resp| Command::Snapshot { resp }).await
    }

    /// Status shown to the user.
    pub async fn indicator(&self) -> Result<SyncIndicator, RuntimeError> {
        self.request(|resp| Command::Indicator { resp }).await
    }

    /// Waits until the current state is written; returns the durable revision.
    pub async fn flush(&self) -> Result<Revision, RuntimeError> {
        self.request(|resp| Command::Flush { resp }).await?
    }

    /// Flushes pending state and stops the task.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Shutdown { resp }).await?
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }
}

struct LoopCtx<'a> {
    events_tx: &'a broadcast::Sender<SyncEvent>,
    network_tx: &'a watch::Sender<NetworkStatus>,
    persist_tx: Option<&'a mpsc::Sender<PersistMsg>>,
    flush_on_enqueue: bool,
}

impl LoopCtx<'_> {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events_tx.send(event);
    }

    async fn persist(&self, store: &SyncStore, urgent: bool) {
        if let Some(tx) = self.persist_tx {
            let msg = PersistMsg::Snapshot {
                snapshot: store.export_snapshot(),
                urgent,
            };
            if tx.send(msg).await.is_err() {
                warn!("persistence worker gone; sync state not written");
            }
        } else {
            self.emit(SyncEvent::DurableUpTo {
                revision: store.revision(),
            });
        }
    }

    fn emit_status_change(&self, before: SyncStatus, store: &SyncStore) {
        if store.sync_status() != before {
            self.emit(SyncEvent::SyncStatusChanged {
                status: store.sync_status(),
            });
        }
    }
}

async fn handle_command(cmd: Command, store: &mut SyncStore, ctx: &LoopCtx<'_>) -> bool {
    let status_before = store.sync_status();

    match cmd {
        Command::Queue { spec, resp } => {
            let table = spec.table;
            let operation = spec.operation;
            let id = store.queue_mutation(spec);
            info!(%id, %table, %operation, "mutation queued");
            ctx.persist(store, ctx.flush_on_enqueue).await;
            ctx.emit(SyncEvent::MutationQueued { id, table });
            let _ = resp.send(id);
        }
        Command::MarkSyncing { id, resp } => {
            let changed = store.mark_syncing(id);
            if changed {
                ctx.persist(store, false).await;
                ctx.emit(SyncEvent::MutationSyncing { id });
            }
            let _ = resp.send(changed);
        }
        Command::Remove { id, resp } => {
            let changed = store.remove_mutation(id);
            if changed {
                ctx.persist(store, false).await;
                ctx.emit(SyncEvent::MutationRemoved { id });
            }
            let _ = resp.send(changed);
        }
        Command::MarkFailed { id, error, resp } => {
            let changed = store.mark_failed(id, error.as_str());
            if changed {
                warn!(%id, %error, "mutation failed permanently");
                ctx.persist(store, false).await;
                ctx.emit(SyncEvent::MutationFailed { id });
            }
            let _ = resp.send(changed);
        }
        Command::IncrementRetry { id, error, resp } => {
            let changed = store.increment_retry(id, error);
            if changed {
                let retry_count = store.get(id).map(|m| m.retry_count).unwrap_or_default();
                debug!(%id, retry_count, "retryable failure recorded");
                ctx.persist(store, false).await;
                ctx.emit(SyncEvent::RetryScheduled { id, retry_count });
            }
            let _ = resp.send(changed);
        }
        Command::Retry { id, resp } => {
            let res = store.retry_mutation(id);
            if res.is_ok() {
                ctx.persist(store, false).await;
                ctx.emit(SyncEvent::MutationRetried { id });
            }
            let _ = resp.send(res);
        }
        Command::Discard { id, resp } => {
            let res = store.discard_mutation(id);
            if res.is_ok() {
                info!(%id, "mutation discarded");
                ctx.persist(store, false).await;
                ctx.emit(SyncEvent::MutationDiscarded { id });
            }
            let _ = resp.send(res);
        }
        Command::RetryAllFailed { resp } => {
            let ids = store.retry_all_failed();
            if !ids.is_empty() {
                ctx.persist(store, false).await;
                for id in &ids {
                    ctx.emit(SyncEvent::MutationRetried { id: *id });
                }
            }
            let _ = resp.send(ids.len());
        }
        Command::BumpEntitySync { table, resp } => {
            let meta = store.bump_entity_sync(table);
            ctx.persist(store, false).await;
            ctx.emit(SyncEvent::EntitySynced {
                table,
                version: meta.version,
            });
            let _ = resp.send(meta);
        }
        Command::SetNetwork { status, resp } => {
            let changed = store.set_network_status(status);
            if changed {
                ctx.network_tx.send_replace(status);
                ctx.emit(SyncEvent::NetworkChanged { status });
            }
            let _ = resp.send(changed);
        }
        Command::BeginPass { resp } => {
            store.begin_pass();
            let _ = resp.send(());
        }
        Command::FinishPass { resp } => {
            let status = store.finish_pass();
            ctx.persist(store, false).await;
            let _ = resp.send(status);
        }
        Command::Get { id, resp } => {
            let _ = resp.send(store.get(id).cloned());
        }
        Command::Pending { resp } => {
            let _ = resp.send(store.pending_in_order());
        }
        Command::Failed { resp } => {
            let _ = resp.send(store.failed());
        }
        Command::Snapshot { resp } => {
            let _ = resp.send(store.export_snapshot());
        }
        Command::Indicator { resp } => {
            let _ = resp.send(store.indicator());
        }
        Command::Flush { resp } => {
            let out = if let Some(tx) = ctx.persist_tx {
                let (flush_tx, flush_rx) = oneshot::channel();
                let msg = PersistMsg::Snapshot {
                    snapshot: store.export_snapshot(),
                    urgent: false,
                };
                if tx.send(msg).await.is_err()
                    || tx.send(PersistMsg::Flush { resp: flush_tx }).await.is_err()
                {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    flush_rx
                        .await
                        .map_err(|_| RuntimeError::ChannelClosed)
                        .and_then(|r| r.map_err(RuntimeError::from))
                }
            } else {
                Ok(store.revision())
            };
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let out = if let Some(tx) = ctx.persist_tx {
                let _ = tx
                    .send(PersistMsg::Snapshot {
                        snapshot: store.export_snapshot(),
                        urgent: false,
                    })
                    .await;
                let (done_tx, done_rx) = oneshot::channel();
                if tx.send(PersistMsg::Shutdown { resp: done_tx }).await.is_err() {
                    Err(RuntimeError::ChannelClosed)
                } else {
                    done_rx.await.map_err(|_| RuntimeError::ChannelClosed)
                }
            } else {
                Ok(())
            };
            let _ = resp.send(out);
            return true;
        }
    }

    ctx.emit_status_change(status_before, store);
    false
}

fn spawn_persistence_worker(
    cache: Arc<dyn DurableCache>,
    mut rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<Revision, PersistError>>,
    config: RuntimeConfig,
) {
    tokio::spawn(async move {
        let latency = Duration::from_millis(config.batch_max_latency_ms);
        let mut dirty: Option<SyncSnapshot> = None;
        let mut deadline = Instant::now() + latency;
        let mut last_durable: Revision = 0;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = write_dirty(&cache, &mut dirty, &mut last_durable, &durable_tx).await;
                        break;
                    };

                    match msg {
                        PersistMsg::Snapshot { snapshot, urgent } => {
                            // Later snapshots supersede earlier ones.
                            if dirty.is_none() {
                                deadline = Instant::now() + latency;
                            }
                            dirty = Some(snapshot);
                            if urgent {
                                let _ = write_dirty(&cache, &mut dirty, &mut last_durable, &durable_tx).await;
                            }
                        }
                        PersistMsg::Flush { resp } => {
                            let result = write_dirty(&cache, &mut dirty, &mut last_durable, &durable_tx).await;
                            let _ = resp.send(result.map(|_| last_durable));
                        }
                        PersistMsg::Shutdown { resp } => {
                            let _ = write_dirty(&cache, &mut dirty, &mut last_durable, &durable_tx).await;
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if dirty.is_some() => {
                    let _ = write_dirty(&cache, &mut dirty, &mut last_durable, &durable_tx).await;
                }
            }
        }
    });
}

async fn write_dirty(
    cache: &Arc<dyn DurableCache>,
    dirty: &mut Option<SyncSnapshot>,
    last_durable: &mut Revision,
    durable_tx: &mpsc::UnboundedSender<Result<Revision, PersistError>>,
) -> Result<(), PersistError> {
    let Some(snapshot) = dirty.take() else {
        return Ok(());
    };

    let revision = snapshot.revision;
    let cache_ref = Arc::clone(cache);
    let write_res: Result<(), PersistError> = tokio::task::spawn_blocking(move || {
        cache_ref.save_sync_state(&snapshot)?;
        cache_ref.flush()
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?;

    match write_res {
        Ok(()) => {
            *last_durable = (*last_durable).max(revision);
            let _ = durable_tx.send(Ok(*last_durable));
            Ok(())
        }
        Err(err) => {
            let _ = durable_tx.send(Err(PersistError::Message(format!("write failed: {err}"))));
            Err(err)
        }
    }
}
