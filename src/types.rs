//! Shared primitive IDs and sync-related enums.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier assigned to a queued mutation.
pub type MutationId = Uuid;
/// Monotonic store revision, bumped on every state transition.
pub type Revision = u64;
/// Milliseconds since the Unix epoch.
pub type TimestampMs = u64;

/// Logical entity types that can carry deferred writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
    /// Pregnancy booklets.
    Booklets,
    /// Doctor access grants on a booklet.
    BookletAccess,
    /// Medical history entries.
    MedicalEntries,
    /// Laboratory requests.
    LabRequests,
    /// Prescribed medications.
    Medications,
    /// Medication intake logs.
    IntakeLogs,
}

impl TableName {
    /// Every syncable table, in declaration order.
    pub const ALL: [TableName; 6] = [
        TableName::Booklets,
        TableName::BookletAccess,
        TableName::MedicalEntries,
        TableName::LabRequests,
        TableName::Medications,
        TableName::IntakeLogs,
    ];

    /// Stable name used in cache keys and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            TableName::Booklets => "booklets",
            TableName::BookletAccess => "booklet_access",
            TableName::MedicalEntries => "medical_entries",
            TableName::LabRequests => "lab_requests",
            TableName::Medications => "medications",
            TableName::IntakeLogs => "intake_logs",
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    /// Insert a new row.
    Create,
    /// Modify an existing row.
    Update,
    /// Remove an existing row.
    Delete,
}

impl MutationOp {
    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide reachability as published by the connectivity monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    /// Connected and the backend is believed reachable.
    Online,
    /// Platform reports no connection.
    Offline,
    /// No information yet.
    #[default]
    Unknown,
}

/// Overall state of the background sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing running and nothing failed.
    #[default]
    Idle,
    /// A drain pass is in progress.
    Syncing,
    /// At least one queued mutation sits in `failed`.
    HasFailures,
}

/// Aggregate status shown by the persistent sync indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncIndicator {
    /// Queue empty, online.
    Synced,
    /// A drain pass is running.
    Syncing,
    /// Writes are waiting for the next pass.
    Pending,
    /// Some writes need user action.
    Failed,
    /// Device is offline.
    Offline,
}

/// Current wall-clock time in milliseconds.
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
