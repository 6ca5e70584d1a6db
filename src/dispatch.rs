//! Writes that execute when online and queue durably when offline.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    mutation::MutationSpec,
    query::QueryCache,
    remote::{RemoteError, RemoteMutation},
    runtime::handle::{RuntimeError, SyncStoreHandle},
    types::{MutationId, MutationOp, NetworkStatus, TableName},
};

/// Boxed error an optimistic update may report.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
/// Local state change applied before the write is confirmed.
pub type OptimisticUpdate = Box<dyn Fn(&Value) -> Result<(), BoxError> + Send + Sync>;
/// Pulls the target row id out of the write arguments.
pub type EntityIdExtractor = Box<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Static metadata attached to one remote write.
pub struct MutationOptions {
    /// Table the write targets.
    pub table: TableName,
    /// Operation the write performs.
    pub operation: MutationOp,
    /// Extracts the target row id for queued records.
    pub entity_id: Option<EntityIdExtractor>,
    /// Applied before the write in both online and offline paths.
    pub optimistic_update: Option<OptimisticUpdate>,
}

impl MutationOptions {
    /// Options with no extractor and no optimistic update.
    pub fn new(table: TableName, operation: MutationOp) -> Self {
        Self {
            table,
            operation,
            entity_id: None,
            optimistic_update: None,
        }
    }

    /// Sets the entity-id extractor.
    pub fn with_entity_id<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        self.entity_id = Some(Box::new(f));
        self
    }

    /// Sets the optimistic update.
    pub fn with_optimistic_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.optimistic_update = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("table", &self.table)
            .field("operation", &self.operation)
            .field("entity_id", &self.entity_id.is_some())
            .field("optimistic_update", &self.optimistic_update.is_some())
            .finish()
    }
}

/// Non-error result of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The write ran online and the backend returned this value.
    Completed(Value),
    /// The write was deferred; reconcile later through the queue.
    Queued(MutationId),
}

/// Failure of a dispatch.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The online write failed; it was not queued.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Enqueueing failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Wraps one remote write with offline deferral.
pub struct MutationDispatcher {
    remote: Arc<dyn RemoteMutation>,
    options: MutationOptions,
    store: SyncStoreHandle,
    queries: QueryCache,
}

impl MutationDispatcher {
    /// Binds `remote` to the store and query cache.
    pub fn new(
        remote: Arc<dyn RemoteMutation>,
        options: MutationOptions,
        store: SyncStoreHandle,
        queries: QueryCache,
    ) -> Self {
        Self {
            remote,
            options,
            store,
            queries,
        }
    }

    /// Metadata this dispatcher was built with.
    pub fn options(&self) -> &MutationOptions {
        &self.options
    }

    /// Runs the write, or queues it when offline.
    ///
    /// Online failures come back as errors and are not queued.
    pub async fn dispatch(&self, args: Value) -> Result<DispatchOutcome, DispatchError> {
        self.apply_optimistic(&args);

        let table = self.options.table;
        if self.store.network_status() == NetworkStatus::Offline {
            let entity_id = self.options.entity_id.as_ref().and_then(|f| f(&args));
            let spec = MutationSpec {
                table,
                operation: self.options.operation,
                entity_id,
                payload: args,
            };
            let id = self.store.queue_mutation(spec).await?;
            return Ok(DispatchOutcome::Queued(id));
        }

        let value = self.remote.execute(&args).await?;
        self.queries.invalidate_table_async(table).await;
        Ok(DispatchOutcome::Completed(value))
    }

    fn apply_optimistic(&self, args: &Value) {
        let Some(update) = &self.options.optimistic_update else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| update(args))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(table = %self.options.table, error = %err, "optimistic update failed");
            }
            Err(_) => {
                warn!(table = %self.options.table, "optimistic update panicked");
            }
        }
    }
}

/// Observable state of a [`MutationHandle`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationState {
    /// A write is in flight.
    pub is_pending: bool,
    /// The last write was deferred to the queue.
    pub is_queued: bool,
    /// Queue id of the deferred write.
    pub queue_id: Option<MutationId>,
    /// Message of the last failure.
    pub error: Option<String>,
    /// Backend result of the last online write.
    pub data: Option<Value>,
}

/// Hook-shaped wrapper: `mutate`, the flags a UI renders, and `reset`.
pub struct MutationHandle {
    dispatcher: Arc<MutationDispatcher>,
    state: MutationState,
}

impl MutationHandle {
    /// Wraps `dispatcher` with empty state.
    pub fn new(dispatcher: Arc<MutationDispatcher>) -> Self {
        Self {
            dispatcher,
            state: MutationState::default(),
        }
    }

    /// Current flags.
    pub fn state(&self) -> &MutationState {
        &self.state
    }

    /// Dispatches `args` and tracks the outcome in [`state`](Self::state).
    pub async fn mutate(&mut self, args: Value) -> Result<DispatchOutcome, DispatchError> {
        self.state = MutationState {
            is_pending: true,
            ..MutationState::default()
        };

        let result = self.dispatcher.dispatch(args).await;
        self.state.is_pending = false;
        match &result {
            Ok(DispatchOutcome::Completed(value)) => {
                self.state.data = Some(value.clone());
            }
            Ok(DispatchOutcome::Queued(id)) => {
                debug!(%id, "write deferred until back online");
                self.state.is_queued = true;
                self.state.queue_id = Some(*id);
            }
            Err(err) => {
                self.state.error = Some(err.to_string());
            }
        }
        result
    }

    /// Clears the tracked state.
    pub fn reset(&mut self) {
        self.state = MutationState::default();
    }
}
