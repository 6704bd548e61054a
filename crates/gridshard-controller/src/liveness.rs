//! Heartbeat-based liveness.
//!
//! A crashed instance never deletes its own record, so its range stays
//! claimed and any joiner it was meant to unlock stays Locked. Records
//! whose heartbeat is older than the TTL are deleted by any live peer,
//! which triggers consolidation everywhere.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use gridshard_directory::{Directory, InstanceRecord};

use crate::error::ControllerResult;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// True if the record's last heartbeat is older than `ttl` at `now`.
pub fn is_expired(record: &InstanceRecord, ttl: Duration, now: u64) -> bool {
    now.saturating_sub(record.last_heartbeat) > ttl.as_secs()
}

/// Delete expired records of one type, never `self_name`.
///
/// Returns the names of reaped records.
pub fn reap_expired(
    directory: &dyn Directory,
    controller_type: &str,
    self_name: &str,
    ttl: Duration,
    now: u64,
) -> ControllerResult<Vec<String>> {
    let mut reaped = Vec::new();
    for record in directory.list(controller_type)? {
        if record.name == self_name || !is_expired(&record, ttl, now) {
            continue;
        }
        if directory.delete(&record.name)? {
            warn!(
                reaped = %record.name,
                controller_type,
                last_heartbeat = record.last_heartbeat,
                "reaped expired instance"
            );
            reaped.push(record.name);
        }
    }
    Ok(reaped)
}
