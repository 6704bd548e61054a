//! Sorted partition view: the process-local reconstruction of a keyspace.
//!
//! All records of one controller type are sorted by `controller_key`;
//! each entry's lower bound is the previous entry's key (0 for the first),
//! and the last entry always extends to `MAX_KEY`.
//!
//! Boundary convention: ranges are half-open `(lowerbound, controller_key]`,
//! except the leftmost partition, which is closed `[0, controller_key]` so
//! that key 0 is always owned.

use serde::{Deserialize, Serialize};

use gridshard_core::{ControllerKey, MAX_KEY, MIN_KEY};
use gridshard_directory::InstanceRecord;

use crate::error::{PartitionError, PartitionResult};

/// A contiguous range of the keyspace under the boundary convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lowerbound: ControllerKey,
    pub upperbound: ControllerKey,
}

impl KeyRange {
    pub fn new(lowerbound: ControllerKey, upperbound: ControllerKey) -> Self {
        Self {
            lowerbound,
            upperbound,
        }
    }

    /// The whole keyspace `[0, MAX_KEY]`.
    pub fn full() -> Self {
        Self::new(MIN_KEY, MAX_KEY)
    }

    pub fn is_leftmost(&self) -> bool {
        self.lowerbound == MIN_KEY
    }

    /// Smallest key actually owned.
    fn first_key(&self) -> ControllerKey {
        if self.is_leftmost() {
            MIN_KEY
        } else {
            self.lowerbound.saturating_add(1)
        }
    }

    pub fn contains(&self, key: ControllerKey) -> bool {
        key >= self.first_key() && key <= self.upperbound
    }

    /// Count of integer keys owned.
    ///
    /// `[0, MAX_KEY]` reports `MAX_KEY`: the true count is one more than
    /// the largest representable key.
    pub fn size(&self) -> i64 {
        if self.is_leftmost() {
            if self.upperbound == MAX_KEY {
                MAX_KEY
            } else {
                self.upperbound - self.lowerbound + 1
            }
        } else {
            self.upperbound - self.lowerbound
        }
    }

    /// True if at least one key belongs to both ranges.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        let (a, b) = (self.first_key(), other.first_key());
        a <= self.upperbound && b <= other.upperbound && a <= other.upperbound && b <= self.upperbound
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_leftmost() {
            write!(f, "[{}, {}]", self.lowerbound, self.upperbound)
        } else {
            write!(f, "({}, {}]", self.lowerbound, self.upperbound)
        }
    }
}

/// One instance's slot in the sorted view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub instance_name: String,
    pub lowerbound_key: ControllerKey,
    pub controller_key: ControllerKey,
    pub workload_num: u32,
    pub is_locked: bool,
}

impl PartitionEntry {
    pub fn range(&self) -> KeyRange {
        KeyRange::new(self.lowerbound_key, self.controller_key)
    }

    pub fn size(&self) -> i64 {
        self.range().size()
    }

    pub fn contains(&self, key: ControllerKey) -> bool {
        self.range().contains(key)
    }
}

/// Sorted, contiguous view over all records of one controller type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionView {
    entries: Vec<PartitionEntry>,
}

impl PartitionView {
    /// Build a view directly from entries that are already sorted.
    pub fn from_entries(entries: Vec<PartitionEntry>) -> Self {
        Self { entries }
    }

    /// Sort records by key and derive contiguous ranges.
    ///
    /// Ties on key are ordered by name so every instance derives the same
    /// view; such a view still fails [`validate_coverage`](Self::validate_coverage).
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a InstanceRecord>) -> Self {
        let mut sorted: Vec<&InstanceRecord> = records.into_iter().collect();
        sorted.sort_by(|a, b| {
            a.controller_key
                .cmp(&b.controller_key)
                .then_with(|| a.name.cmp(&b.name))
        });

        let mut entries = Vec::with_capacity(sorted.len());
        let mut lowerbound = MIN_KEY;
        for record in sorted {
            entries.push(PartitionEntry {
                instance_name: record.name.clone(),
                lowerbound_key: lowerbound,
                controller_key: record.controller_key,
                workload_num: record.workload_num,
                is_locked: record.is_locked,
            });
            lowerbound = record.controller_key;
        }
        // The rightmost survivor always extends to the end of the keyspace.
        if let Some(last) = entries.last_mut() {
            last.controller_key = MAX_KEY;
        }

        Self { entries }
    }

    /// Check full, exact coverage of `[0, MAX_KEY]`.
    pub fn validate_coverage(&self) -> PartitionResult<()> {
        let (Some(first), Some(last)) = (self.entries.first(), self.entries.last()) else {
            return Ok(());
        };
        if first.lowerbound_key != MIN_KEY {
            return Err(PartitionError::MalformedSnapshot(format!(
                "first partition {} starts at {}",
                first.instance_name, first.lowerbound_key
            )));
        }
        if last.controller_key != MAX_KEY {
            return Err(PartitionError::MalformedSnapshot(format!(
                "last partition {} ends at {}",
                last.instance_name, last.controller_key
            )));
        }
        for entry in &self.entries {
            if entry.controller_key <= MIN_KEY {
                return Err(PartitionError::MalformedSnapshot(format!(
                    "instance {} claims non-positive key {}",
                    entry.instance_name, entry.controller_key
                )));
            }
        }
        for pair in self.entries.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if prev.controller_key >= next.controller_key {
                return Err(PartitionError::MalformedSnapshot(format!(
                    "instances {} and {} both claim key {}",
                    prev.instance_name, next.instance_name, next.controller_key
                )));
            }
            if prev.controller_key != next.lowerbound_key {
                let kind = if prev.range().overlaps(&next.range()) {
                    "overlap"
                } else {
                    "gap"
                };
                return Err(PartitionError::MalformedSnapshot(format!(
                    "{kind} between {} and {}",
                    prev.instance_name, next.instance_name
                )));
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&PartitionEntry> {
        self.entries.get(pos)
    }

    pub(crate) fn get_mut(&mut self, pos: usize) -> Option<&mut PartitionEntry> {
        self.entries.get_mut(pos)
    }

    /// Index of the named instance.
    pub fn position(&self, instance_name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.instance_name == instance_name)
    }

    pub fn entry(&self, instance_name: &str) -> Option<&PartitionEntry> {
        self.position(instance_name).map(|pos| &self.entries[pos])
    }

    /// Entry whose range contains `key`.
    pub fn owner_of(&self, key: ControllerKey) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.contains(key))
    }

    /// Overwrite the workload gauge of one entry. Returns false if the position is unknown.
    pub fn set_workload_num(&mut self, pos: usize, workload_num: u32) -> bool {
        match self.get_mut(pos) {
            Some(entry) => {
                entry.workload_num = workload_num;
                true
            }
            None => false,
        }
    }
}
