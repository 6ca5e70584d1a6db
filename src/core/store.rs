use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{
    mutation::{EntitySyncMeta, MutationSpec, MutationStatus, PendingMutation, SyncSnapshot},
    types::{
        MutationId, NetworkStatus, Revision, SyncIndicator, SyncStatus, TableName, TimestampMs,
        now_ms,
    },
};

/// Rejected queue transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No queued mutation carries this id.
    #[error("no queued mutation with id {0}")]
    MissingMutation(MutationId),
    /// The record is not in a state that allows the transition.
    #[error("mutation {id} is {actual:?}; cannot {action}")]
    InvalidTransition {
        /// Mutation id.
        id: MutationId,
        /// Status found on the record.
        actual: MutationStatus,
        /// Transition that was attempted.
        action: &'static str,
    },
}

/// Authoritative in-memory sync state.
///
/// Every change goes through one of the transition methods below; each one
/// that changes state bumps [`SyncStore::revision`].
#[derive(Debug, Default)]
pub struct SyncStore {
    queue: Vec<PendingMutation>,
    entity_meta: BTreeMap<TableName, EntitySyncMeta>,
    network: NetworkStatus,
    sync_status: SyncStatus,
    last_sync_at: Option<TimestampMs>,
    last_enqueue_ts: TimestampMs,
    revision: Revision,
}

impl SyncStore {
    /// Empty store: no queue, status unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from a persisted snapshot.
    ///
    /// Records persisted as `syncing` are demoted to `pending`: the outcome of
    /// the interrupted attempt is unknown and must be treated as not applied.
    pub fn from_snapshot(snapshot: SyncSnapshot) -> Self {
        let mut queue = snapshot.queue;
        for m in queue.iter_mut() {
            if m.status == MutationStatus::Syncing {
                m.status = MutationStatus::Pending;
            }
        }
        let last_enqueue_ts = queue.iter().map(|m| m.timestamp).max().unwrap_or(0);

        let mut store = Self {
            queue,
            entity_meta: snapshot.entity_meta,
            network: NetworkStatus::Unknown,
            sync_status: SyncStatus::Idle,
            last_sync_at: snapshot.last_sync_at,
            last_enqueue_ts,
            revision: snapshot.revision,
        };
        store.sync_status = store.settled_status();
        store
    }

    /// Copies the persistable state.
    pub fn export_snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            revision: self.revision,
            network: self.network,
            sync_status: self.sync_status,
            queue: self.queue.clone(),
            entity_meta: self.entity_meta.clone(),
            last_sync_at: self.last_sync_at,
        }
    }

    /// Appends a fresh `pending` record and returns its id.
    pub fn queue_mutation(&mut self, spec: MutationSpec) -> MutationId {
        // Never let the wall clock step backwards inside the queue.
        let timestamp = now_ms().max(self.last_enqueue_ts);
        self.last_enqueue_ts = timestamp;

        let id = Uuid::new_v4();
        self.queue.push(PendingMutation {
            id,
            status: MutationStatus::Pending,
            table: spec.table,
            operation: spec.operation,
            entity_id: spec.entity_id,
            payload: spec.payload,
            retry_count: 0,
            last_error: None,
            last_attempt: None,
            timestamp,
        });
        self.bump();
        id
    }

    /// `pending → syncing`. Returns false when the record is gone or not pending.
    pub fn mark_syncing(&mut self, id: MutationId) -> bool {
        let Some(m) = self.find_mut(id) else {
            return false;
        };
        if m.status != MutationStatus::Pending {
            return false;
        }
        m.status = MutationStatus::Syncing;
        m.last_attempt = Some(now_ms());
        self.bump();
        true
    }

    /// Success path: drops the record.
    pub fn remove_mutation(&mut self, id: MutationId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|m| m.id != id);
        if self.queue.len() == before {
            return false;
        }
        self.clear_failures_if_resolved();
        self.bump();
        true
    }

    /// Terminal failure; overall status becomes `has_failures`.
    pub fn mark_failed(&mut self, id: MutationId, error: impl Into<String>) -> bool {
        let Some(m) = self.find_mut(id) else {
            return false;
        };
        m.status = MutationStatus::Failed;
        m.last_error = Some(error.into());
        m.last_attempt = Some(now_ms());
        self.sync_status = SyncStatus::HasFailures;
        self.bump();
        true
    }

    /// Retryable failure: back to `pending` with one more retry counted.
    pub fn increment_retry(&mut self, id: MutationId, error: impl Into<String>) -> bool {
        let Some(m) = self.find_mut(id) else {
            return false;
        };
        m.status = MutationStatus::Pending;
        m.retry_count += 1;
        m.last_error = Some(error.into());
        m.last_attempt = Some(now_ms());
        self.clear_failures_if_resolved();
        self.bump();
        true
    }

    /// User retry: `failed → pending` with the retry budget reset.
    pub fn retry_mutation(&mut self, id: MutationId) -> Result<(), StoreError> {
        let m = self.find_mut(id).ok_or(StoreError::MissingMutation(id))?;
        if m.status != MutationStatus::Failed {
            return Err(StoreError::InvalidTransition {
                id,
                actual: m.status,
                action: "retry",
            });
        }
        m.status = MutationStatus::Pending;
        m.retry_count = 0;
        self.clear_failures_if_resolved();
        self.bump();
        Ok(())
    }

    /// User discard. In-flight records cannot be discarded.
    pub fn discard_mutation(&mut self, id: MutationId) -> Result<(), StoreError> {
        let m = self.find(id).ok_or(StoreError::MissingMutation(id))?;
        if m.status == MutationStatus::Syncing {
            return Err(StoreError::InvalidTransition {
                id,
                actual: m.status,
                action: "discard",
            });
        }
        self.queue.retain(|m| m.id != id);
        self.clear_failures_if_resolved();
        self.bump();
        Ok(())
    }

    /// Retries every failed record; returns the ids that were reset.
    pub fn retry_all_failed(&mut self) -> Vec<MutationId> {
        let mut ids = Vec::new();
        for m in self.queue.iter_mut() {
            if m.status == MutationStatus::Failed {
                m.status = MutationStatus::Pending;
                m.retry_count = 0;
                ids.push(m.id);
            }
        }
        if !ids.is_empty() {
            self.clear_failures_if_resolved();
            self.bump();
        }
        ids
    }

    /// Stamps a successful replay for `table`.
    pub fn bump_entity_sync(&mut self, table: TableName) -> EntitySyncMeta {
        let meta = self.entity_meta.entry(table).or_default();
        meta.last_sync_timestamp = now_ms().max(meta.last_sync_timestamp);
        meta.version += 1;
        let out = *meta;
        self.bump();
        out
    }

    /// Records a connectivity change. Returns false when unchanged.
    pub fn set_network_status(&mut self, status: NetworkStatus) -> bool {
        if self.network == status {
            return false;
        }
        self.network = status;
        self.bump();
        true
    }

    /// Marks the start of a drain pass.
    pub fn begin_pass(&mut self) {
        self.sync_status = SyncStatus::Syncing;
        self.bump();
    }

    /// Marks the end of a drain pass and settles the overall status.
    pub fn finish_pass(&mut self) -> SyncStatus {
        self.sync_status = self.settled_status();
        self.last_sync_at = Some(now_ms());
        self.bump();
        self.sync_status
    }

    /// Record by id.
    pub fn get(&self, id: MutationId) -> Option<&PendingMutation> {
        self.find(id)
    }

    /// Queue in enqueue order.
    pub fn queue(&self) -> &[PendingMutation] {
        &self.queue
    }

    /// Pending records sorted by enqueue timestamp, ties in submission order.
    pub fn pending_in_order(&self) -> Vec<PendingMutation> {
        let mut out: Vec<PendingMutation> = self
            .queue
            .iter()
            .filter(|m| m.status == MutationStatus::Pending)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.timestamp);
        out
    }

    /// Records waiting for user action.
    pub fn failed(&self) -> Vec<PendingMutation> {
        self.queue
            .iter()
            .filter(|m| m.status == MutationStatus::Failed)
            .cloned()
            .collect()
    }

    /// Sync metadata for `table`, if it was ever synced.
    pub fn entity_meta(&self, table: TableName) -> Option<EntitySyncMeta> {
        self.entity_meta.get(&table).copied()
    }

    /// Last recorded connectivity.
    pub fn network_status(&self) -> NetworkStatus {
        self.network
    }

    /// Overall queue status.
    pub fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    /// Monotonic change counter.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// True while any record is failed.
    pub fn has_failures(&self) -> bool {
        self.queue.iter().any(|m| m.status == MutationStatus::Failed)
    }

    /// Status for the persistent sync indicator.
    pub fn indicator(&self) -> SyncIndicator {
        if self.network == NetworkStatus::Offline {
            return SyncIndicator::Offline;
        }
        if self.has_failures() {
            return SyncIndicator::Failed;
        }
        if self.sync_status == SyncStatus::Syncing {
            return SyncIndicator::Syncing;
        }
        if self.queue.is_empty() {
            SyncIndicator::Synced
        } else {
            SyncIndicator::Pending
        }
    }

    fn settled_status(&self) -> SyncStatus {
        if self.has_failures() {
            SyncStatus::HasFailures
        } else {
            SyncStatus::Idle
        }
    }

    fn clear_failures_if_resolved(&mut self) {
        if self.sync_status == SyncStatus::HasFailures && !self.has_failures() {
            self.sync_status = SyncStatus::Idle;
        }
    }

    fn find(&self, id: MutationId) -> Option<&PendingMutation> {
        self.queue.iter().find(|m| m.id == id)
    }

    fn find_mut(&mut self, id: MutationId) -> Option<&mut PendingMutation> {
        self.queue.iter_mut().find(|m| m.id == id)
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}
