//! Error types for controller coordination.

use thiserror::Error;

use gridshard_directory::DirectoryError;
use gridshard_partition::PartitionError;

/// Result type alias for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Every CAS attempt conflicted; the write is retried on the next cycle.
    #[error("write to {name} deferred after {attempts} conflicting attempts")]
    Deferred { name: String, attempts: u32 },

    #[error("could not join {controller_type} after {attempts} attempts")]
    JoinExhausted {
        controller_type: String,
        attempts: u32,
    },

    #[error("controller {0} is halted on a malformed snapshot")]
    Halted(String),
}

impl ControllerError {
    /// True if this instance's own record is gone from the directory.
    pub fn is_evicted(&self) -> bool {
        matches!(self, ControllerError::Partition(PartitionError::NotFound(_)))
    }
}
