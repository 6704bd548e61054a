//! Directory trait and its redb-backed implementation.
//!
//! `RedbDirectory` keeps instance records in a single redb table and
//! enforces optimistic concurrency: every update names the version it
//! read, and the write transaction rejects it if the stored version has
//! moved on. Committed writes are published to watchers through a
//! `tokio::sync::broadcast` channel, in commit order.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{DirectoryError, DirectoryResult};
use crate::tables::INSTANCES;
use crate::types::{DirectoryEvent, InstanceRecord};

/// Capacity of the watch fan-out channel. Slow watchers past this lag and re-list.
const WATCH_CAPACITY: usize = 1024;

/// Convert any `Display` error into a `DirectoryError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| DirectoryError::$variant(e.to_string())
    };
}

/// List + watch + conditional-update store of instance records.
///
/// Any key/value or pub-sub system offering these primitives can back
/// the coordination protocol.
pub trait Directory: Send + Sync {
    /// All records of one controller type.
    fn list(&self, controller_type: &str) -> DirectoryResult<Vec<InstanceRecord>>;

    /// A single record by instance name.
    fn get(&self, name: &str) -> DirectoryResult<Option<InstanceRecord>>;

    /// Subscribe to changes of one controller type. Events of one record
    /// arrive in commit order.
    fn watch(&self, controller_type: &str) -> DirectoryWatch;

    /// Create a record. Fails with `AlreadyExists` on a name collision.
    /// Returns the assigned version.
    fn create(&self, record: &InstanceRecord) -> DirectoryResult<u64>;

    /// Apply `mutation` if the stored version equals `expected_version`.
    /// Fails with `Conflict` otherwise. Returns the new version.
    fn update(
        &self,
        name: &str,
        expected_version: u64,
        mutation: &mut dyn FnMut(&mut InstanceRecord),
    ) -> DirectoryResult<u64>;

    /// Delete a record. Returns true if it existed.
    fn delete(&self, name: &str) -> DirectoryResult<bool>;
}

/// Why a watch stopped yielding events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchError {
    /// The watcher fell behind and missed `n` events; re-list to recover.
    Lagged(u64),
    /// The directory was dropped.
    Closed,
}

/// A stream of directory events for one controller type.
pub struct DirectoryWatch {
    rx: broadcast::Receiver<DirectoryEvent>,
    controller_type: String,
}

impl DirectoryWatch {
    /// Wrap a broadcast receiver, filtering to one controller type.
    pub fn new(rx: broadcast::Receiver<DirectoryEvent>, controller_type: &str) -> Self {
        Self {
            rx,
            controller_type: controller_type.to_string(),
        }
    }

    pub fn controller_type(&self) -> &str {
        &self.controller_type
    }

    /// Wait for the next event of the watched type.
    pub async fn recv(&mut self) -> Result<DirectoryEvent, WatchError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.controller_type() == self.controller_type => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(WatchError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(WatchError::Closed),
            }
        }
    }

    /// Take the next already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Result<Option<DirectoryEvent>, WatchError> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.controller_type() == self.controller_type => {
                    return Ok(Some(event));
                }
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Err(WatchError::Lagged(n));
                }
                Err(broadcast::error::TryRecvError::Closed) => return Err(WatchError::Closed),
            }
        }
    }
}

/// Thread-safe directory backed by redb.
#[derive(Clone)]
pub struct RedbDirectory {
    db: Arc<Database>,
    events: broadcast::Sender<DirectoryEvent>,
    /// Held from `begin_write` until the event is published, so watchers
    /// see events in commit order.
    write_order: Arc<Mutex<()>>,
}

impl RedbDirectory {
    /// Open (or create) a persistent directory at the given path.
    pub fn open(path: &Path) -> DirectoryResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let directory = Self::from_database(db)?;
        debug!(?path, "directory opened");
        Ok(directory)
    }

    /// Create an ephemeral in-memory directory (for testing).
    pub fn open_in_memory() -> DirectoryResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let directory = Self::from_database(db)?;
        debug!("in-memory directory opened");
        Ok(directory)
    }

    fn from_database(db: Database) -> DirectoryResult<Self> {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        let directory = Self {
            db: Arc::new(db),
            events,
            write_order: Arc::new(Mutex::new(())),
        };
        directory.ensure_tables()?;
        Ok(directory)
    }

    /// Create the instances table if it doesn't exist yet.
    fn ensure_tables(&self) -> DirectoryResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Every record of every controller type, ordered by name.
    pub fn list_all(&self) -> DirectoryResult<Vec<InstanceRecord>> {
        self.scan(|_| true)
    }

    fn scan(&self, keep: impl Fn(&InstanceRecord) -> bool) -> DirectoryResult<Vec<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: InstanceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        // The guarded value is `()`, so a poisoned lock is still usable.
        self.write_order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: DirectoryEvent) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(event);
    }
}

impl Directory for RedbDirectory {
    fn list(&self, controller_type: &str) -> DirectoryResult<Vec<InstanceRecord>> {
        self.scan(|r| r.controller_type == controller_type)
    }

    fn get(&self, name: &str) -> DirectoryResult<Option<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: InstanceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn watch(&self, controller_type: &str) -> DirectoryWatch {
        DirectoryWatch::new(self.events.subscribe(), controller_type)
    }

    fn create(&self, record: &InstanceRecord) -> DirectoryResult<u64> {
        let mut stored = record.clone();
        stored.version = 1;
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;

        let _order = self.lock_writes();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let exists = table
                .get(stored.name.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if exists {
                return Err(DirectoryError::AlreadyExists(stored.name));
            }
            table
                .insert(stored.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        debug!(name = %stored.name, key = stored.controller_key, "instance record created");
        self.publish(DirectoryEvent::Added(stored));
        Ok(1)
    }

    fn update(
        &self,
        name: &str,
        expected_version: u64,
        mutation: &mut dyn FnMut(&mut InstanceRecord),
    ) -> DirectoryResult<u64> {
        let _order = self.lock_writes();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let current: InstanceRecord = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(DirectoryError::NotFound(name.to_string())),
            };
            if current.version != expected_version {
                return Err(DirectoryError::Conflict {
                    name: name.to_string(),
                    expected: expected_version,
                    actual: current.version,
                });
            }

            let mut updated = current.clone();
            mutation(&mut updated);
            // Identity and version belong to the directory.
            updated.name = current.name;
            updated.controller_type = current.controller_type;
            updated.version = current.version + 1;

            let value = serde_json::to_vec(&updated).map_err(map_err!(Serialize))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
            updated
        };
        txn.commit().map_err(map_err!(Transaction))?;

        let version = updated.version;
        debug!(%name, version, "instance record updated");
        self.publish(DirectoryEvent::Updated(updated));
        Ok(version)
    }

    fn delete(&self, name: &str) -> DirectoryResult<bool> {
        let _order = self.lock_writes();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed: Option<InstanceRecord> = {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let removed = table.remove(name).map_err(map_err!(Write))?;
            match removed {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;

        let existed = removed.is_some();
        debug!(%name, existed, "instance record deleted");
        if let Some(record) = removed {
            self.publish(DirectoryEvent::Deleted(record));
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridshard_core::MAX_KEY;

    fn test_directory() -> RedbDirectory {
        RedbDirectory::open_in_memory().unwrap()
    }

    fn record(name: &str, controller_type: &str, key: i64) -> InstanceRecord {
        InstanceRecord::new(name, controller_type, key, false)
    }

    // ── Create / get / list ────────────────────────────────────────

    #[test]
    fn create_and_get() {
        let dir = test_directory();
        let version = dir.create(&record("a", "cluster", MAX_KEY)).unwrap();
        assert_eq!(version, 1);

        let stored = dir.get("a").unwrap().unwrap();
        assert_eq!(stored.controller_key, MAX_KEY);
        assert_eq!(stored.version, 1);
        assert!(!stored.is_locked);
    }

    #[test]
    fn create_duplicate_name_fails() {
        let dir = test_directory();
        dir.create(&record("a", "cluster", 10)).unwrap();
        let err = dir.create(&record("a", "cluster", 20)).unwrap_err();
        assert!(matches!(err, DirectoryError::AlreadyExists(name) if name == "a"));
        assert_eq!(dir.get("a").unwrap().unwrap().controller_key, 10);
    }

    #[test]
    fn list_filters_by_type() {
        let dir = test_directory();
        dir.create(&record("a", "cluster", 10)).unwrap();
        dir.create(&record("b", "cluster", 20)).unwrap();
        dir.create(&record("c", "site", 30)).unwrap();

        assert_eq!(dir.list("cluster").unwrap().len(), 2);
        assert_eq!(dir.list("site").unwrap().len(), 1);
        assert!(dir.list("unknown").unwrap().is_empty());
        assert_eq!(dir.list_all().unwrap().len(), 3);
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let dir = test_directory();
        assert!(dir.get("nope").unwrap().is_none());
    }

    // ── Conditional update ─────────────────────────────────────────

    #[test]
    fn update_with_current_version_bumps_version() {
        let dir = test_directory();
        dir.create(&InstanceRecord::new("a", "cluster", 10, true)).unwrap();

        let version = dir.update("a", 1, &mut |r| r.is_locked = false).unwrap();
        assert_eq!(version, 2);

        let stored = dir.get("a").unwrap().unwrap();
        assert!(!stored.is_locked);
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn update_with_stale_version_conflicts() {
        let dir = test_directory();
        dir.create(&record("a", "cluster", 10)).unwrap();
        dir.update("a", 1, &mut |r| r.workload_num = 5).unwrap();

        let err = dir.update("a", 1, &mut |r| r.workload_num = 9).unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(
            err,
            DirectoryError::Conflict { expected: 1, actual: 2, .. }
        ));
        assert_eq!(dir.get("a").unwrap().unwrap().workload_num, 5);
    }

    #[test]
    fn update_missing_record_is_not_found() {
        let dir = test_directory();
        let err = dir.update("ghost", 1, &mut |_| {}).unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }

    #[test]
    fn update_cannot_change_identity_or_version() {
        let dir = test_directory();
        dir.create(&record("a", "cluster", 10)).unwrap();
        dir.update("a", 1, &mut |r| {
            r.name = "b".to_string();
            r.controller_type = "site".to_string();
            r.version = 99;
            r.controller_key = 42;
        })
        .unwrap();

        let stored = dir.get("a").unwrap().unwrap();
        assert_eq!(stored.controller_type, "cluster");
        assert_eq!(stored.version, 2);
        assert_eq!(stored.controller_key, 42);
        assert!(dir.get("b").unwrap().is_none());
    }

    // ── Delete ─────────────────────────────────────────────────────

    #[test]
    fn delete_reports_existence() {
        let dir = test_directory();
        dir.create(&record("a", "cluster", 10)).unwrap();
        assert!(dir.delete("a").unwrap());
        assert!(!dir.delete("a").unwrap());
        assert!(dir.get("a").unwrap().is_none());
    }

    // ── Watch ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn watch_delivers_events_of_its_type_in_order() {
        let dir = test_directory();
        let mut watch = dir.watch("cluster");

        dir.create(&record("a", "cluster", 10)).unwrap();
        dir.create(&record("s", "site", 10)).unwrap();
        dir.update("a", 1, &mut |r| r.workload_num = 3).unwrap();
        dir.delete("a").unwrap();

        let first = watch.recv().await.unwrap();
        assert!(matches!(first, DirectoryEvent::Added(ref r) if r.name == "a"));
        let second = watch.recv().await.unwrap();
        assert!(matches!(second, DirectoryEvent::Updated(ref r) if r.workload_num == 3));
        let third = watch.recv().await.unwrap();
        assert_eq!(third.kind(), "deleted");
        assert_eq!(third.record().name, "a");
        assert_eq!(watch.try_recv().unwrap(), None);
    }

    #[test]
    fn failed_writes_publish_nothing() {
        let dir = test_directory();
        dir.create(&record("a", "cluster", 10)).unwrap();
        let mut watch = dir.watch("cluster");

        assert!(dir.create(&record("a", "cluster", 10)).is_err());
        assert!(dir.update("a", 7, &mut |_| {}).is_err());
        assert!(!dir.delete("ghost").unwrap());

        assert_eq!(watch.try_recv().unwrap(), None);
    }

    #[test]
    fn lagging_watch_reports_lag() {
        let dir = test_directory();
        let mut watch = dir.watch("cluster");
        dir.create(&record("a", "cluster", 10)).unwrap();
        let mut version = 1;
        for i in 0..(WATCH_CAPACITY as u32 + 10) {
            version = dir.update("a", version, &mut |r| r.workload_num = i).unwrap();
        }

        assert!(matches!(watch.try_recv(), Err(WatchError::Lagged(_))));
        // After reporting the lag the watch resumes from the oldest retained event.
        assert!(watch.try_recv().unwrap().is_some());
    }

    #[test]
    fn concurrent_writers_publish_in_commit_order() {
        let dir = test_directory();
        let mut watch = dir.watch("cluster");
        dir.create(&record("a", "cluster", MAX_KEY)).unwrap();

        std::thread::scope(|s| {
            for writer in 0..4u32 {
                let dir = &dir;
                s.spawn(move || {
                    for i in 0..50u32 {
                        if writer == 0 && i == 25 {
                            dir.delete("a").unwrap();
                            return;
                        }
                        let Some(current) = dir.get("a").unwrap() else {
                            return;
                        };
                        match dir.update("a", current.version, &mut |r| r.workload_num = i) {
                            Ok(_) | Err(DirectoryError::Conflict { .. }) => {}
                            Err(DirectoryError::NotFound(_)) => return,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    }
                });
            }
        });

        let mut last_version = 0;
        let mut deleted = false;
        while let Some(event) = watch.try_recv().unwrap() {
            assert!(!deleted, "event after delete: {event:?}");
            let version = event.record().version;
            match event {
                DirectoryEvent::Deleted(_) => {
                    assert_eq!(version, last_version);
                    deleted = true;
                }
                _ => {
                    assert!(version > last_version, "{version} after {last_version}");
                    last_version = version;
                }
            }
        }
        assert!(deleted);
        assert!(dir.get("a").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("directory.redb");

        {
            let dir = RedbDirectory::open(&db_path).unwrap();
            dir.create(&record("a", "cluster", MAX_KEY)).unwrap();
            dir.update("a", 1, &mut |r| r.workload_num = 12).unwrap();
        }

        let dir = RedbDirectory::open(&db_path).unwrap();
        let stored = dir.get("a").unwrap().unwrap();
        assert_eq!(stored.workload_num, 12);
        assert_eq!(stored.version, 2);
    }
}
