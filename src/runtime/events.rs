//! Runtime event stream payloads.

use crate::types::{MutationId, NetworkStatus, Revision, SyncStatus, TableName};

/// Events emitted from the single-writer store loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A mutation was appended to the queue.
    MutationQueued {
        /// Queue id.
        id: MutationId,
        /// Target table.
        table: TableName,
    },
    /// A mutation's network call is about to start.
    MutationSyncing {
        /// Queue id.
        id: MutationId,
    },
    /// A mutation left the queue after succeeding.
    MutationRemoved {
        /// Queue id.
        id: MutationId,
    },
    /// A mutation failed for good.
    MutationFailed {
        /// Queue id.
        id: MutationId,
    },
    /// A retryable failure was recorded.
    RetryScheduled {
        /// Queue id.
        id: MutationId,
        /// Retry count after the increment.
        retry_count: u32,
    },
    /// The user moved a failed mutation back to pending.
    MutationRetried {
        /// Queue id.
        id: MutationId,
    },
    /// The user dropped a mutation.
    MutationDiscarded {
        /// Queue id.
        id: MutationId,
    },
    /// A table's sync metadata advanced.
    EntitySynced {
        /// Table.
        table: TableName,
        /// Version after the bump.
        version: u64,
    },
    /// The store's network snapshot changed.
    NetworkChanged {
        /// New status.
        status: NetworkStatus,
    },
    /// Overall sync status changed.
    SyncStatusChanged {
        /// New status.
        status: SyncStatus,
    },
    /// Persistence has reached at least this revision.
    DurableUpTo {
        /// Highest revision known durable.
        revision: Revision,
    },
}

impl SyncEvent {
    /// Whether the event can make a drain pass worthwhile.
    pub fn may_trigger_drain(&self) -> bool {
        matches!(
            self,
            SyncEvent::MutationQueued { .. }
                | SyncEvent::MutationRetried { .. }
                | SyncEvent::NetworkChanged {
                    status: NetworkStatus::Online
                }
        )
    }
}
