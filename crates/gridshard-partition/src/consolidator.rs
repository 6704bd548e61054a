//! Consolidation: recompute the sorted view from a fresh directory snapshot.
//!
//! Pure and idempotent. Running it twice over the same snapshot reports
//! `is_updated = false` the second time.

use tracing::debug;

use gridshard_core::ControllerKey;
use gridshard_directory::InstanceRecord;

use crate::error::{PartitionError, PartitionResult};
use crate::view::{KeyRange, PartitionView};

/// Outcome of one consolidation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consolidation {
    pub view: PartitionView,
    /// Any entry's membership, bounds, lock flag or workload changed.
    pub is_updated: bool,
    /// This instance's own bounds or position changed.
    pub is_self_updated: bool,
    pub lowerbound: ControllerKey,
    pub upperbound: ControllerKey,
    pub pos: usize,
}

impl Consolidation {
    pub fn range(&self) -> KeyRange {
        KeyRange::new(self.lowerbound, self.upperbound)
    }

    /// True if this instance is the last entry and owns up to `MAX_KEY`.
    pub fn is_rightmost(&self) -> bool {
        self.pos + 1 == self.view.len()
    }
}

/// Rebuild the view from `records` and locate `self_name` in it.
///
/// `cached` is the view from the previous successful pass (empty before the
/// first one). Fails with `MalformedSnapshot` if the records do not cover
/// the keyspace exactly, and with `NotFound` if this instance is missing.
pub fn consolidate(
    cached: &PartitionView,
    records: &[InstanceRecord],
    self_name: &str,
) -> PartitionResult<Consolidation> {
    if let Some(first) = records.first()
        && let Some(other) = records
            .iter()
            .find(|r| r.controller_type != first.controller_type)
    {
        return Err(PartitionError::MalformedSnapshot(format!(
            "snapshot mixes controller types {} and {}",
            first.controller_type, other.controller_type
        )));
    }

    let view = PartitionView::from_records(records);
    view.validate_coverage()?;

    let pos = view
        .position(self_name)
        .ok_or_else(|| PartitionError::NotFound(self_name.to_string()))?;
    let own = &view.entries()[pos];
    let (lowerbound, upperbound) = (own.lowerbound_key, own.controller_key);

    let is_updated = view != *cached;
    let is_self_updated = match cached.position(self_name) {
        Some(cached_pos) => {
            let before = &cached.entries()[cached_pos];
            cached_pos != pos
                || before.lowerbound_key != lowerbound
                || before.controller_key != upperbound
        }
        None => true,
    };

    debug!(
        controller = self_name,
        instances = view.len(),
        pos,
        lowerbound,
        upperbound,
        is_updated,
        is_self_updated,
        "consolidated view"
    );

    Ok(Consolidation {
        view,
        is_updated,
        is_self_updated,
        lowerbound,
        upperbound,
        pos,
    })
}
