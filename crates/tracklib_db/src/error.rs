//! Error types for the store handle.

use thiserror::Error;

/// Store operation result type.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The store could not be created or opened. Fatal at library startup.
    #[error("Failed to open store: {0}")]
    Open(String),

    /// A statement failed to prepare or execute.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The running statement was aborted by `DbConnection::interrupt`.
    #[error("Statement interrupted")]
    Interrupted,

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Cannot close store with {0} open transaction(s)")]
    TransactionsOpen(usize),

    #[error("Store is closed")]
    Closed,

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),
}

impl BackendError {
    /// Create an execution error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// True when this error means the statement was cancelled rather than failed.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                Self::Interrupted
            }
            _ => Self::Sqlite(err),
        }
    }
}
