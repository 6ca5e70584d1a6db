//! Offline-first sync for the maternal-health booklet app.
//!
//! Reads are served cache-first and writes made while offline are queued
//! durably, then replayed in order once connectivity returns.
//!
//! # Examples
//!
//! Queue transitions on the in-memory [`core::store::SyncStore`]:
//! ```
//! use maternal_sync::{
//!     core::store::SyncStore,
//!     mutation::MutationSpec,
//!     types::{MutationOp, SyncIndicator, TableName},
//! };
//! use serde_json::json;
//!
//! let mut store = SyncStore::new();
//! let id = store.queue_mutation(MutationSpec::new(
//!     TableName::Medications,
//!     MutationOp::Create,
//!     json!({ "name": "Ferrous sulfate", "dosage": "325mg" }),
//! ));
//! assert_eq!(store.indicator(), SyncIndicator::Pending);
//! assert!(store.mark_syncing(id));
//! assert!(store.remove_mutation(id));
//! assert_eq!(store.indicator(), SyncIndicator::Synced);
//! ```
//!
//! Full service on a SQLite-backed cache:
//! ```no_run
//! use std::sync::Arc;
//!
//! use maternal_sync::{
//!     config::SyncConfig,
//!     connectivity::NetworkProbe,
//!     persist::sqlite::SqliteCache,
//!     remote::OperationRegistry,
//!     runtime::service::SyncService,
//! };
//!
//! # async fn run(probe: Arc<dyn NetworkProbe>) {
//! let cache = SqliteCache::open("sync.db").expect("open sqlite");
//! let service = SyncService::start(
//!     Arc::new(cache),
//!     probe,
//!     OperationRegistry::new(),
//!     SyncConfig::default(),
//! )
//! .await
//! .expect("start");
//! service.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Tunables for every component.
pub mod config;
/// Connectivity observation and debouncing.
pub mod connectivity;
/// Core in-memory sync state.
pub mod core;
/// Online-or-queue write dispatch.
pub mod dispatch;
/// Queue records and persisted snapshot types.
pub mod mutation;
/// Durable key/value cache and its backends.
pub mod persist;
/// Background queue replay.
pub mod processor;
/// Cache-first query adapter.
pub mod query;
/// Remote operation traits, error kinds and registry.
pub mod remote;
/// Single-writer runtime handle, events and service.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
