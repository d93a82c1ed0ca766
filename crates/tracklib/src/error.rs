//! Error types for query execution, dispatch and indexing.

use crate::query::{QueryId, QueryStatus};
use std::path::PathBuf;
use thiserror::Error;
use tracklib_db::BackendError;

/// Errors returned from a query body.
///
/// `Canceled` and an interrupted store are not failures: the query ends as
/// `Canceled` instead of `Failed`.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Query canceled")]
    Canceled,

    #[error("Store error: {0}")]
    Store(#[from] BackendError),

    #[error("Query failed: {0}")]
    Failed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueryError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// True for cancellation in either form.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::Store(BackendError::Interrupted))
    }
}

/// Errors from handing a query to the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Dispatcher is closed")]
    Closed,

    #[error("Query {0} was already submitted")]
    AlreadySubmitted(QueryId),

    #[error("Synchronous enqueue from the dispatcher thread would deadlock")]
    WouldDeadlock,

    #[error("Failed to start dispatcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors from an indexer run.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Synchronization canceled")]
    Canceled,

    /// A file or directory could not be read. Logged and skipped.
    #[error("Failed to read {}: {message}", .path.display())]
    Enumeration { path: PathBuf, message: String },

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Query '{name}' ended as {status}: {message}")]
    Query {
        name: &'static str,
        status: QueryStatus,
        message: String,
    },

    #[error("Failed to start indexer thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Errors surfaced to the owner of a library.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Store error: {0}")]
    Store(#[from] BackendError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Indexer error: {0}")]
    Indexer(#[from] IndexerError),
}

/// Errors from the query registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown query kind: {0}")]
    UnknownKind(String),

    #[error("Invalid query request: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
