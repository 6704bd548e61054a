//! Domain types for the GridShard directory.
//!
//! An [`InstanceRecord`] is the unit of shared state: one per running
//! controller instance. Records are serialized to JSON for storage.

use serde::{Deserialize, Serialize};

use gridshard_core::ControllerKey;

/// Unique name of a controller instance.
pub type InstanceName = String;

/// Shared, directory-owned record of one controller instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    pub name: InstanceName,
    /// Partition domain. Ranges are maintained independently per type.
    pub controller_type: String,
    /// Inclusive upper bound of this instance's owned range.
    pub controller_key: ControllerKey,
    /// Approximate count of items currently owned.
    pub workload_num: u32,
    /// True while the instance must not act on its nominal range.
    pub is_locked: bool,
    /// Optimistic-concurrency token, bumped by the directory on every write.
    pub version: u64,
    /// Unix timestamp (seconds) of the last health report.
    pub last_heartbeat: u64,
}

impl InstanceRecord {
    /// Build a fresh record. The directory assigns the version on create.
    pub fn new(
        name: impl Into<String>,
        controller_type: impl Into<String>,
        controller_key: ControllerKey,
        is_locked: bool,
    ) -> Self {
        Self {
            name: name.into(),
            controller_type: controller_type.into(),
            controller_key,
            workload_num: 0,
            is_locked,
            version: 0,
            last_heartbeat: 0,
        }
    }
}

/// A committed directory change, as seen by watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    Added(InstanceRecord),
    Updated(InstanceRecord),
    Deleted(InstanceRecord),
}

impl DirectoryEvent {
    /// The record carried by this event (the last known state for deletes).
    pub fn record(&self) -> &InstanceRecord {
        match self {
            DirectoryEvent::Added(r) | DirectoryEvent::Updated(r) | DirectoryEvent::Deleted(r) => r,
        }
    }

    pub fn controller_type(&self) -> &str {
        &self.record().controller_type
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            DirectoryEvent::Added(_) => "added",
            DirectoryEvent::Updated(_) => "updated",
            DirectoryEvent::Deleted(_) => "deleted",
        }
    }
}
