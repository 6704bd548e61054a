//! GridShard keyspace partitioning: pure algorithms over directory snapshots.
//!
//! Nothing in this crate performs I/O. Controller instances feed it the
//! records they listed from the directory and act on the results.
//!
//! # Components
//!
//! - **`view`**: Sorted reconstruction of all records of a type into contiguous ranges
//! - **`assigner`**: Key a joining instance should claim (largest partition, load tie-break)
//! - **`consolidator`**: Recompute the view from a fresh snapshot and report what moved

pub mod assigner;
pub mod consolidator;
pub mod error;
pub mod view;

pub use assigner::{KeyAssignment, assign_key};
pub use consolidator::{Consolidation, consolidate};
pub use error::{PartitionError, PartitionResult};
pub use view::{KeyRange, PartitionEntry, PartitionView};
