//! Ownership states and the signal published on every change.

use serde::{Deserialize, Serialize};

use gridshard_partition::KeyRange;

/// Ownership state of one controller instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    /// Must not act on its nominal range until unlocked.
    Locked,
    /// Finishing a sweep over a range that has since shrunk.
    Wait,
    /// Owns and may process its range.
    Active,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Locked => write!(f, "locked"),
            ControllerState::Wait => write!(f, "wait"),
            ControllerState::Active => write!(f, "active"),
        }
    }
}

/// What the workload collaborator needs to reset its filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipSignal {
    pub state: ControllerState,
    pub range: KeyRange,
    pub halted: bool,
}

impl OwnershipSignal {
    /// True if the holder may act on keys in `range`.
    pub fn is_active(&self) -> bool {
        self.state == ControllerState::Active && !self.halted
    }
}
