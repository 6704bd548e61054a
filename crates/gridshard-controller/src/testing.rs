//! Directory wrapper that injects concurrent writers for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use gridshard_directory::{
    Directory, DirectoryError, DirectoryResult, DirectoryWatch, InstanceRecord, RedbDirectory,
};

/// In-memory directory that can simulate racing writers.
pub(crate) struct FlakyDirectory {
    inner: RedbDirectory,
    update_conflicts: AtomicU32,
    create_collisions: AtomicU32,
    rival: Mutex<Option<String>>,
}

impl FlakyDirectory {
    pub(crate) fn new() -> Self {
        Self {
            inner: RedbDirectory::open_in_memory().unwrap(),
            update_conflicts: AtomicU32::new(0),
            create_collisions: AtomicU32::new(0),
            rival: Mutex::new(None),
        }
    }

    /// The next `n` updates lose a race against another writer.
    pub(crate) fn inject_update_conflicts(&self, n: u32) {
        self.update_conflicts.store(n, Ordering::SeqCst);
    }

    /// The next `n` creates hit a name collision.
    pub(crate) fn inject_create_collisions(&self, n: u32) {
        self.create_collisions.store(n, Ordering::SeqCst);
    }

    /// Right before the next create, a rival named `name` claims the same key.
    pub(crate) fn inject_rival(&self, name: &str) {
        *self.rival.lock().unwrap() = Some(name.to_string());
    }
}

impl Directory for FlakyDirectory {
    fn list(&self, controller_type: &str) -> DirectoryResult<Vec<InstanceRecord>> {
        self.inner.list(controller_type)
    }

    fn get(&self, name: &str) -> DirectoryResult<Option<InstanceRecord>> {
        self.inner.get(name)
    }

    fn watch(&self, controller_type: &str) -> DirectoryWatch {
        self.inner.watch(controller_type)
    }

    fn create(&self, record: &InstanceRecord) -> DirectoryResult<u64> {
        if self
            .create_collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DirectoryError::AlreadyExists(record.name.clone()));
        }
        if let Some(rival) = self.rival.lock().unwrap().take() {
            let mut claim = record.clone();
            claim.name = rival;
            self.inner.create(&claim)?;
        }
        self.inner.create(record)
    }

    fn update(
        &self,
        name: &str,
        expected_version: u64,
        mutation: &mut dyn FnMut(&mut InstanceRecord),
    ) -> DirectoryResult<u64> {
        if self
            .update_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            // Another writer lands first and bumps the version.
            let actual = self.inner.update(name, expected_version, &mut |_| {})?;
            return Err(DirectoryError::Conflict {
                name: name.to_string(),
                expected: expected_version,
                actual,
            });
        }
        self.inner.update(name, expected_version, mutation)
    }

    fn delete(&self, name: &str) -> DirectoryResult<bool> {
        self.inner.delete(name)
    }
}
