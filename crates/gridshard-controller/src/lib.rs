//! gridshard-controller: leaderless ownership of keyspace partitions.
//!
//! Each controller instance owns one contiguous range of the keyspace for
//! its controller type. Instances coordinate only through the directory:
//! they list, watch, and conditionally update each other's records.
//!
//! # Architecture
//!
//! ```text
//! ControllerRunner (one task per instance)
//!   ├── DirectoryWatch → apply_event() → consolidate → state transition
//!   ├── resync tick    → list → consolidate
//!   ├── health tick    → report_health() and reap expired records
//!   └── shutdown       → leave() deletes own record
//!
//! ControllerBase (owned by the runner, shared with handles)
//!   ├── Locked → Active    explicit unlock by the successor, or no successor
//!   ├── Active → Wait      lost leading scope to a joiner
//!   └── Wait   → Active    done_processing(), which unlocks the joiner
//! ```

pub mod base;
pub mod error;
pub mod handoff;
pub mod liveness;
pub mod runner;
pub mod state;

#[cfg(test)]
mod testing;

pub use base::{ControllerBase, ControllerSnapshot, JoinSettings};
pub use error::{ControllerError, ControllerResult};
pub use runner::{ControllerHandle, ControllerRunner, CoordinationSettings};
pub use state::{ControllerState, OwnershipSignal};
