//! Transport boundary: remote operation traits, error kinds, and the
//! `(table, operation)` registry the sync processor replays against.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use hashbrown::HashMap;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::types::{MutationOp, TableName};

/// Message fragments that identify network-class failures when a transport
/// only reports free text.
const CONNECTION_INDICATORS: [&str; 13] = [
    "network",
    "enotfound",
    "eai_again",
    "ehostunreach",
    "enetunreach",
    "unreachable",
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "fetch failed",
    "failed to fetch",
    "socket hang up",
];

const SERVER_INDICATORS: [&str; 6] = [
    "internal server error",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "status 5",
    "status code 5",
];

const TIMEOUT_INDICATORS: [&str; 4] = ["timeout", "timed out", "timedout", "etimedout"];

/// True when the message carries a standalone three-digit 5xx status token.
fn has_server_status(lower: &str) -> bool {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|tok| tok.len() == 3 && tok.starts_with('5') && tok.bytes().all(|b| b.is_ascii_digit()))
}

/// Failure class reported at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// The call did not complete in time.
    Timeout,
    /// Connection refused, reset or unreachable.
    Connection,
    /// 5xx-equivalent backend failure.
    Server,
    /// Payload rejected by backend validation.
    Validation,
    /// Caller not authenticated or not allowed.
    Unauthorized,
    /// Anything else.
    Other,
}

impl RemoteErrorKind {
    /// Network-class kinds are retried; everything else fails fast.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RemoteErrorKind::Timeout | RemoteErrorKind::Connection | RemoteErrorKind::Server
        )
    }
}

/// Error returned by a remote read or write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    /// Failure class.
    pub kind: RemoteErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl RemoteError {
    /// Error of `kind` with `message`.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Timeout-class error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }

    /// Connection-class error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Connection, message)
    }

    /// Validation error; never retried.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Validation, message)
    }

    /// Classifies a bare transport message against known network-failure
    /// fragments. Anything unrecognized becomes [`RemoteErrorKind::Other`].
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let kind = if SERVER_INDICATORS.iter().any(|ind| lower.contains(ind)) || has_server_status(&lower) {
            RemoteErrorKind::Server
        } else if TIMEOUT_INDICATORS.iter().any(|ind| lower.contains(ind)) {
            RemoteErrorKind::Timeout
        } else if CONNECTION_INDICATORS.iter().any(|ind| lower.contains(ind)) {
            RemoteErrorKind::Connection
        } else {
            RemoteErrorKind::Other
        };
        Self { kind, message }
    }

    /// Whether the processor should try again.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// A remote write the dispatcher or the sync processor can execute.
#[async_trait]
pub trait RemoteMutation: Send + Sync {
    /// Runs the write with the exact payload the caller supplied.
    async fn execute(&self, payload: &Value) -> Result<Value, RemoteError>;
}

/// A remote read whose results are cached per argument set.
#[async_trait]
pub trait RemoteQuery: Send + Sync {
    /// Result type.
    type Output: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Stable operation name, prefixed by its table (`medications.byBooklet`).
    fn name(&self) -> &str;

    /// Fetches the current server value.
    async fn fetch(&self, args: &Value) -> Result<Self::Output, RemoteError>;
}

/// Closed mapping from `(table, operation)` to the concrete remote write.
#[derive(Default, Clone)]
pub struct OperationRegistry {
    ops: HashMap<(TableName, MutationOp), Arc<dyn RemoteMutation>>,
}

impl OperationRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the write for a pair.
    pub fn register(
        &mut self,
        table: TableName,
        operation: MutationOp,
        remote: Arc<dyn RemoteMutation>,
    ) -> &mut Self {
        self.ops.insert((table, operation), remote);
        self
    }

    /// Remote write for the pair, if registered.
    pub fn get(&self, table: TableName, operation: MutationOp) -> Option<Arc<dyn RemoteMutation>> {
        self.ops.get(&(table, operation)).cloned()
    }

    /// Number of registered pairs.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .ops
            .keys()
            .map(|(t, o)| format!("{t}.{o}"))
            .collect();
        keys.sort();
        f.debug_struct("OperationRegistry").field("ops", &keys).finish()
    }
}

/// Adapter turning an async closure into a [`RemoteMutation`].
pub struct FnMutation<F>(pub F);

#[async_trait]
impl<F, Fut> RemoteMutation for FnMutation<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    async fn execute(&self, payload: &Value) -> Result<Value, RemoteError> {
        (self.0)(payload.clone()).await
    }
}
