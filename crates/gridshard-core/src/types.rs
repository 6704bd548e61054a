//! Keyspace types shared across GridShard crates.
//!
//! Workload items (clusters, sites) hash into the integer keyspace
//! `[MIN_KEY, MAX_KEY]`. Each controller instance owns a contiguous
//! sub-range identified by its inclusive upper bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// A position in the keyspace. Also used as a controller's inclusive upper bound.
pub type ControllerKey = i64;

/// Smallest key. Always owned by the leftmost partition.
pub const MIN_KEY: ControllerKey = 0;

/// Largest key. Always the upper bound of the rightmost partition.
pub const MAX_KEY: ControllerKey = i64::MAX;

static NAME_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hash a workload item's identity into `[MIN_KEY, MAX_KEY]`.
///
/// Takes the first eight bytes of the SHA-256 digest and clears the sign
/// bit, so the result is stable across processes and platforms.
pub fn key_for(item: &str) -> ControllerKey {
    let digest = Sha256::digest(item.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) & (i64::MAX as u64)) as ControllerKey
}

/// Generate a unique controller instance name for the given type.
///
/// Mixes the process id, wall clock and a process-local sequence so that
/// several instances started in the same process never collide.
pub fn generate_instance_name(controller_type: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = NAME_SEQ.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(controller_type.as_bytes());
    hasher.update(std::process::id().to_be_bytes());
    hasher.update(nanos.to_be_bytes());
    hasher.update(seq.to_be_bytes());
    let digest = hasher.finalize();

    format!("{controller_type}-{}", hex::encode(&digest[..6]))
}
