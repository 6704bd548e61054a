//! Partitioning error types.

use thiserror::Error;

/// Errors produced by the partitioning algorithms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("no partition can be split further ({partitions} partitions)")]
    NoCapacity { partitions: usize },

    #[error("instance not found in snapshot: {0}")]
    NotFound(String),

    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
}

pub type PartitionResult<T> = Result<T, PartitionError>;
