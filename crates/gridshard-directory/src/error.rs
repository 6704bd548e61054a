//! Error types for the GridShard directory.

use thiserror::Error;

/// Result type alias for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Errors that can occur during directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("version conflict on {name}: expected {expected}, found {actual}")]
    Conflict {
        name: String,
        expected: u64,
        actual: u64,
    },
}

impl DirectoryError {
    /// True for an optimistic-concurrency rejection that a fresh read can resolve.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DirectoryError::Conflict { .. })
    }
}
