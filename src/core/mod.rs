//! In-memory sync state machine.

/// Authoritative queue, per-table metadata and overall status.
pub mod store;
