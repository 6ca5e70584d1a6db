//! Background replay of the offline mutation queue.
//!
//! One [`SyncProcessor`] runs per process. It drains the queue whenever the
//! store reports the network online and pending work exists, one mutation at
//! a time in enqueue order.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use hashbrown::HashSet;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::ProcessorConfig,
    mutation::PendingMutation,
    query::QueryCache,
    remote::OperationRegistry,
    runtime::{
        events::SyncEvent,
        handle::{RuntimeError, SyncStoreHandle},
    },
    types::{MutationId, NetworkStatus},
};

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another pass was already running; nothing was done.
    pub skipped: bool,
    /// Connectivity dropped before the batch finished.
    pub aborted_offline: bool,
    /// Mutations replayed and removed.
    pub succeeded: usize,
    /// Mutations put back for another attempt.
    pub retried: usize,
    /// Mutations moved to `failed`.
    pub failed: usize,
    /// Pending mutations appeared that this pass did not pick up.
    pub arrived_during_pass: bool,
}

/// Clears the drain flag however the pass ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Replays the queue against the registered remote writes.
pub struct SyncProcessor {
    store: SyncStoreHandle,
    registry: Arc<OperationRegistry>,
    queries: QueryCache,
    config: ProcessorConfig,
    draining: AtomicBool,
    task: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
}

impl SyncProcessor {
    /// Builds an idle processor; call [`start`](Self::start) to run the loop.
    pub fn new(
        store: SyncStoreHandle,
        registry: Arc<OperationRegistry>,
        queries: QueryCache,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queries,
            config,
            draining: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// True while a pass is running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// True while the trigger loop is running.
    pub fn is_running(&self) -> bool {
        self.task.lock().map(|t| t.is_some()).unwrap_or(false)
    }

    /// Starts the trigger loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut slot) = self.task.lock() else {
            warn!("sync processor task slot poisoned; not starting");
            return;
        };
        if slot.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let events = self.store.subscribe();
        let handle = tokio::spawn(Arc::clone(self).run(events, stop_rx));
        *slot = Some((handle, stop_tx));
        info!("sync processor started");
    }

    /// Stops the trigger loop after any in-flight pass finishes.
    pub async fn stop(&self) {
        let taken = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some((handle, stop_tx)) = taken {
            let _ = stop_tx.send(true);
            let _ = handle.await;
            info!("sync processor stopped");
        }
    }

    async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<SyncEvent>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        // Work rehydrated from a previous run counts as a trigger.
        let mut triggered = true;
        let mut rearm_at: Option<Instant> = None;

        loop {
            if triggered {
                triggered = false;
                if !self.debounce(&mut events, &mut stop_rx).await {
                    break;
                }
                if self.should_drain().await {
                    match self.drain_once().await {
                        Ok(report) => {
                            if report.arrived_during_pass {
                                triggered = true;
                            } else if report.aborted_offline {
                                // Connectivity may have come back before we resubscribe.
                                triggered = self.store.network_status() == NetworkStatus::Online;
                            } else if report.retried > 0 && !report.aborted_offline {
                                rearm_at = Some(Instant::now() + self.config.retry_delay());
                            }
                        }
                        Err(RuntimeError::ChannelClosed) => break,
                        Err(err) => warn!(error = %err, "drain pass failed"),
                    }
                }
                // Triggers that fired mid-pass are dropped; the end-of-pass
                // check above already covered new work.
                events = events.resubscribe();
                continue;
            }

            tokio::select! {
                evt = events.recv() => {
                    match evt {
                        Ok(evt) => triggered = evt.may_trigger_drain(),
                        Err(broadcast::error::RecvError::Lagged(_)) => triggered = true,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = sleep_until_opt(rearm_at), if rearm_at.is_some() => {
                    rearm_at = None;
                    triggered = true;
                }
                _ = stop_rx.changed() => break,
            }
        }
        debug!("sync processor loop exited");
    }

    /// Waits out the trigger debounce window, swallowing further events.
    /// Returns false when asked to stop.
    async fn debounce(
        &self,
        events: &mut broadcast::Receiver<SyncEvent>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let deadline = Instant::now() + self.config.trigger_debounce();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                evt = events.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = evt {
                        return false;
                    }
                }
                _ = stop_rx.changed() => return false,
            }
        }
    }

    async fn should_drain(&self) -> bool {
        if self.store.network_status() != NetworkStatus::Online {
            return false;
        }
        match self.store.pending_mutations().await {
            Ok(pending) => !pending.is_empty(),
            Err(_) => false,
        }
    }

    /// Runs one drain pass over the currently pending mutations.
    ///
    /// Returns a skipped report when a pass is already in progress.
    pub async fn drain_once(&self) -> Result<DrainReport, RuntimeError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("drain already running; trigger ignored");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        if self.store.network_status() != NetworkStatus::Online {
            return Ok(report);
        }

        // Already in replay order.
        let batch = self.store.pending_mutations().await?;
        if batch.is_empty() {
            return Ok(report);
        }

        info!(count = batch.len(), "sync pass started");
        self.store.begin_pass().await?;
        let pass_result = self.replay(&batch, &mut report).await;
        let status = self.store.finish_pass().await?;
        pass_result?;

        let seen: HashSet<MutationId> = batch.iter().map(|m| m.id).collect();
        report.arrived_during_pass = !report.aborted_offline
            && self
                .store
                .pending_mutations()
                .await?
                .iter()
                .any(|m| !seen.contains(&m.id));

        info!(
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            aborted = report.aborted_offline,
            ?status,
            "sync pass finished"
        );
        Ok(report)
    }

    async fn replay(&self, batch: &[PendingMutation], report: &mut DrainReport) -> Result<(), RuntimeError> {
        let delay = self.config.inter_mutation_delay();

        for (idx, mutation) in batch.iter().enumerate() {
            if self.store.network_status() != NetworkStatus::Online {
                warn!(remaining = batch.len() - idx, "connectivity lost; stopping sync pass");
                report.aborted_offline = true;
                break;
            }

            if !self.store.mark_syncing(mutation.id).await? {
                // Removed or discarded since the batch was taken.
                continue;
            }
            self.replay_one(mutation, report).await?;

            if idx + 1 < batch.len() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn replay_one(&self, mutation: &PendingMutation, report: &mut DrainReport) -> Result<(), RuntimeError> {
        let id = mutation.id;
        let table = mutation.table;
        let operation = mutation.operation;

        let Some(remote) = self.registry.get(table, operation) else {
            let message = format!("Unsupported operation: {operation} on {table}");
            self.store.mark_failed(id, message).await?;
            report.failed += 1;
            return Ok(());
        };

        match remote.execute(&mutation.payload).await {
            Ok(_) => {
                self.store.remove_mutation(id).await?;
                self.queries.invalidate_table_async(table).await;
                self.store.bump_entity_sync(table).await?;
                debug!(%id, %table, %operation, "mutation replayed");
                report.succeeded += 1;
            }
            Err(err) if err.is_retryable() && mutation.retry_count < self.config.max_retries => {
                self.store.increment_retry(id, err.to_string()).await?;
                report.retried += 1;
            }
            Err(err) => {
                let message = if err.is_retryable() {
                    format!("{err} (gave up after {} retries)", mutation.retry_count)
                } else {
                    err.to_string()
                };
                self.store.mark_failed(id, message).await?;
                report.failed += 1;
            }
        }
        Ok(())
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
