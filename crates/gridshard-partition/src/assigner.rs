//! Key assignment for a joining instance.
//!
//! The joiner splits the largest partition in half and claims the lower
//! half: its key is the midpoint, and the split partition's owner keeps
//! its own key while its lower bound moves up to the midpoint.

use tracing::debug;

use gridshard_core::{ControllerKey, MAX_KEY};

use crate::error::{PartitionError, PartitionResult};
use crate::view::{PartitionEntry, PartitionView};

/// Result of a key assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAssignment {
    /// Key the joining instance claims as its `controller_key`.
    pub key: ControllerKey,
    /// Owner of the partition that was split. `None` for the first instance.
    ///
    /// It becomes the joiner's successor and so the instance that unlocks it.
    pub split_owner: Option<String>,
}

/// Pick the partition to split: largest size, then largest workload, then first.
fn select_partition(view: &PartitionView) -> Option<&PartitionEntry> {
    let mut selected: Option<&PartitionEntry> = None;
    for entry in view.entries() {
        selected = match selected {
            None => Some(entry),
            Some(best) => {
                let (size, best_size) = (entry.size(), best.size());
                if size > best_size || (size == best_size && entry.workload_num > best.workload_num) {
                    Some(entry)
                } else {
                    Some(best)
                }
            }
        };
    }
    selected
}

/// Compute the key a new instance should claim given the current view.
pub fn assign_key(view: &PartitionView) -> PartitionResult<KeyAssignment> {
    let Some(target) = select_partition(view) else {
        return Ok(KeyAssignment {
            key: MAX_KEY,
            split_owner: None,
        });
    };

    let span = target.controller_key - target.lowerbound_key;
    if span <= 1 {
        return Err(PartitionError::NoCapacity {
            partitions: view.len(),
        });
    }

    let key = target.lowerbound_key + span / 2;
    debug!(
        split = %target.instance_name,
        range = %target.range(),
        workload = target.workload_num,
        key,
        "assigned key"
    );

    Ok(KeyAssignment {
        key,
        split_owner: Some(target.instance_name.clone()),
    })
}
