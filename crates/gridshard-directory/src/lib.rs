//! gridshard-directory: the shared instance directory for GridShard.
//!
//! The directory is the only coordination medium between controller
//! instances. It stores one [`InstanceRecord`] per running instance and
//! offers three primitives:
//!
//! - **list** the records of a controller type,
//! - **watch** a type for add/update/delete events,
//! - **conditional update** guarded by a per-record version.
//!
//! [`RedbDirectory`] is the bundled implementation: records are
//! JSON-serialized into a redb table keyed by instance name, and every
//! committed write is fanned out to watchers over a broadcast channel.
//! Other stores plug in through the [`Directory`] trait.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{DirectoryError, DirectoryResult};
pub use store::{Directory, DirectoryWatch, RedbDirectory, WatchError};
pub use types::*;
