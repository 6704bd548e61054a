//! Conditional read-modify-write against the directory.
//!
//! Every write to an instance record (the unlock of a joiner, health
//! reports, self-promotion) goes through [`cas_update`]. A version
//! conflict triggers a fresh read and a new attempt; blind overwrites
//! never happen.

use tracing::warn;

use gridshard_directory::{Directory, DirectoryError, InstanceRecord};

use crate::error::{ControllerError, ControllerResult};

/// What a [`cas_update`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The mutation was committed at this version.
    Written(u64),
    /// The stored record already matched; nothing was written.
    Unchanged(u64),
    /// The record no longer exists.
    Vanished,
}

/// Apply `mutation` to the named record, retrying on version conflicts.
///
/// Returns `Deferred` after `max_attempts` conflicting attempts.
pub fn cas_update(
    directory: &dyn Directory,
    name: &str,
    max_attempts: u32,
    mut mutation: impl FnMut(&mut InstanceRecord),
) -> ControllerResult<CasOutcome> {
    for attempt in 1..=max_attempts {
        let Some(current) = directory.get(name)? else {
            return Ok(CasOutcome::Vanished);
        };

        let mut desired = current.clone();
        mutation(&mut desired);
        if desired == current {
            return Ok(CasOutcome::Unchanged(current.version));
        }

        match directory.update(name, current.version, &mut mutation) {
            Ok(version) => return Ok(CasOutcome::Written(version)),
            Err(DirectoryError::NotFound(_)) => return Ok(CasOutcome::Vanished),
            Err(e) if e.is_conflict() => {
                warn!(record = name, attempt, max_attempts, error = %e, "CAS conflict, re-reading");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(ControllerError::Deferred {
        name: name.to_string(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyDirectory;

    fn seeded() -> FlakyDirectory {
        let dir = FlakyDirectory::new();
        dir.create(&InstanceRecord::new("a", "cluster", 100, true))
            .unwrap();
        dir
    }

    #[test]
    fn writes_on_first_attempt() {
        let dir = seeded();
        let outcome = cas_update(&dir, "a", 3, |r| r.is_locked = false).unwrap();
        assert_eq!(outcome, CasOutcome::Written(2));
        assert!(!dir.get("a").unwrap().unwrap().is_locked);
    }

    #[test]
    fn retries_through_conflicts() {
        let dir = seeded();
        dir.inject_update_conflicts(2);
        let outcome = cas_update(&dir, "a", 3, |r| r.workload_num = 9).unwrap();
        // Two interleaved writers bumped the version before ours landed.
        assert_eq!(outcome, CasOutcome::Written(4));
        assert_eq!(dir.get("a").unwrap().unwrap().workload_num, 9);
    }

    #[test]
    fn exhausted_attempts_are_deferred() {
        let dir = seeded();
        dir.inject_update_conflicts(5);
        let err = cas_update(&dir, "a", 3, |r| r.workload_num = 9).unwrap_err();
        assert!(matches!(err, ControllerError::Deferred { attempts: 3, .. }));
        assert_eq!(dir.get("a").unwrap().unwrap().workload_num, 0);
    }

    #[test]
    fn unchanged_record_is_not_rewritten() {
        let dir = seeded();
        let outcome = cas_update(&dir, "a", 3, |r| r.is_locked = true).unwrap();
        assert_eq!(outcome, CasOutcome::Unchanged(1));
    }

    #[test]
    fn missing_record_vanished() {
        let dir = seeded();
        let outcome = cas_update(&dir, "ghost", 3, |r| r.is_locked = false).unwrap();
        assert_eq!(outcome, CasOutcome::Vanished);
    }
}
