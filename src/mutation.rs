//! Deferred-write records, enqueue drafts, and per-table sync metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{MutationId, MutationOp, NetworkStatus, Revision, SyncStatus, TableName, TimestampMs};

/// Version number for serialized [`SyncSnapshotEnvelope`] payloads.
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

/// Lifecycle state of a queued mutation.
///
/// There is no `Succeeded` state: success removes the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting for the next drain pass.
    Pending,
    /// Its network call is in flight.
    Syncing,
    /// Terminal until the user retries or discards it.
    Failed,
}

/// Durable record of one deferred write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Queue-assigned identifier.
    pub id: MutationId,
    /// Lifecycle state.
    pub status: MutationStatus,
    /// Entity type the write targets.
    pub table: TableName,
    /// Create, update or delete.
    pub operation: MutationOp,
    /// Target row for update/delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Exact arguments replayed against the remote write.
    pub payload: Value,
    /// Retryable failures seen so far.
    pub retry_count: u32,
    /// Message of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Time of the most recent sync attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<TimestampMs>,
    /// Enqueue time; replay order key.
    pub timestamp: TimestampMs,
}

/// Enqueue draft used to create a [`PendingMutation`].
#[derive(Debug, Clone, PartialEq)]
pub struct MutationSpec {
    /// Entity type the write targets.
    pub table: TableName,
    /// Create, update or delete.
    pub operation: MutationOp,
    /// Target row for update/delete.
    pub entity_id: Option<String>,
    /// Arguments for the remote write.
    pub payload: Value,
}

impl MutationSpec {
    /// Builds a spec without an entity id.
    pub fn new(table: TableName, operation: MutationOp, payload: Value) -> Self {
        Self {
            table,
            operation,
            entity_id: None,
            payload,
        }
    }

    /// Sets the target entity id.
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

/// Per-table diagnostics: when it last synced and how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntitySyncMeta {
    /// Time of the last successful replay for this table.
    pub last_sync_timestamp: TimestampMs,
    /// Bumped on every successful replay.
    pub version: u64,
}

/// Point-in-time copy of the whole sync state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    /// Store revision the snapshot was taken at.
    pub revision: Revision,
    /// Network status as last reported to the store.
    #[serde(skip, default)]
    pub network: NetworkStatus,
    /// Overall sync status.
    pub sync_status: SyncStatus,
    /// Queue in enqueue order.
    pub queue: Vec<PendingMutation>,
    /// Per-table sync metadata.
    pub entity_meta: BTreeMap<TableName, EntitySyncMeta>,
    /// Time the last drain pass finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<TimestampMs>,
}

impl SyncSnapshot {
    /// Entries still waiting for replay.
    pub fn pending(&self) -> impl Iterator<Item = &PendingMutation> {
        self.queue
            .iter()
            .filter(|m| m.status == MutationStatus::Pending)
    }

    /// Entries awaiting user retry or discard.
    pub fn failed(&self) -> impl Iterator<Item = &PendingMutation> {
        self.queue
            .iter()
            .filter(|m| m.status == MutationStatus::Failed)
    }
}

/// Versioned wrapper for stable on-disk payload decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshotEnvelope {
    /// Payload format version.
    pub format_version: u16,
    /// Wrapped snapshot.
    pub snapshot: SyncSnapshot,
}

impl SyncSnapshotEnvelope {
    /// Constructs an envelope using [`SNAPSHOT_FORMAT_VERSION`].
    pub fn new(snapshot: SyncSnapshot) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot,
        }
    }
}
