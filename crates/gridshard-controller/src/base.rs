//! Per-instance coordination state and the ownership state machine.
//!
//! A [`ControllerBase`] is created by [`ControllerBase::join`], which claims
//! a key and writes the instance's record. From then on every directory
//! change is fed through [`apply_event`](ControllerBase::apply_event) or
//! [`resync`](ControllerBase::resync); both rebuild the sorted view and
//! drive state transitions. The owning process reports finished sweeps
//! through [`is_done_processing_current_workloads`](ControllerBase::is_done_processing_current_workloads),
//! which is what unlocks a joiner.
//!
//! Handoff direction: a joiner claims the lower half of the partition it
//! splits, so a Locked instance sits directly before its unlocker in the
//! sorted view and shares its unlocker's lower bound as its own key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gridshard_core::{ControllerKey, MAX_KEY, MIN_KEY, generate_instance_name, key_for};
use gridshard_directory::{Directory, DirectoryError, DirectoryEvent, InstanceRecord};
use gridshard_partition::{KeyRange, PartitionError, PartitionView, assign_key, consolidate};

use crate::error::{ControllerError, ControllerResult};
use crate::handoff::{CasOutcome, cas_update};
use crate::liveness::epoch_secs;
use crate::state::{ControllerState, OwnershipSignal};

/// Bounds for the join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinSettings {
    pub max_join_attempts: u32,
    pub max_cas_attempts: u32,
    /// Base delay between join attempts; grows with the attempt number.
    pub backoff: Duration,
}

impl Default for JoinSettings {
    fn default() -> Self {
        Self {
            max_join_attempts: 5,
            max_cas_attempts: 5,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Point-in-time view of one instance, for status output and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerSnapshot {
    pub name: String,
    pub controller_type: String,
    pub controller_key: ControllerKey,
    pub state: ControllerState,
    pub range: KeyRange,
    pub pos: usize,
    pub halted: bool,
    pub workload_num: u32,
    pub unlocker: Option<String>,
    pub view: PartitionView,
}

impl ControllerSnapshot {
    pub fn is_active(&self) -> bool {
        self.state == ControllerState::Active && !self.halted
    }
}

/// Coordination state of one controller instance.
pub struct ControllerBase {
    name: String,
    controller_type: String,
    directory: Arc<dyn Directory>,
    /// Own upper bound as claimed in the directory.
    controller_key: ControllerKey,
    range: KeyRange,
    cur_pos: usize,
    view: PartitionView,
    /// Cached snapshot of every record of this type.
    records: BTreeMap<String, InstanceRecord>,
    state: ControllerState,
    halted: bool,
    workload_num: u32,
    max_cas_attempts: u32,
    signal: watch::Sender<OwnershipSignal>,
}

impl ControllerBase {
    /// Claim a key for a new instance of `controller_type` and register it.
    ///
    /// The first instance of a type starts Active and owns `[0, MAX_KEY]`;
    /// every later one starts Locked on the lower half of the partition it
    /// splits.
    pub async fn join(
        directory: Arc<dyn Directory>,
        controller_type: &str,
        settings: JoinSettings,
    ) -> ControllerResult<Self> {
        for attempt in 1..=settings.max_join_attempts {
            if attempt > 1 {
                let jitter_ms = key_for(&generate_instance_name(controller_type)) as u64
                    % (settings.backoff.as_millis() as u64).max(1);
                let delay = settings.backoff * attempt + Duration::from_millis(jitter_ms);
                tokio::time::sleep(delay).await;
            }

            match Self::try_join(&directory, controller_type, settings.max_cas_attempts) {
                Ok(Some(base)) => return Ok(base),
                Ok(None) => {}
                Err(ControllerError::Partition(PartitionError::MalformedSnapshot(reason))) => {
                    warn!(controller_type, attempt, %reason, "directory not consolidated, retrying join");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ControllerError::JoinExhausted {
            controller_type: controller_type.to_string(),
            attempts: settings.max_join_attempts,
        })
    }

    /// One join attempt. `Ok(None)` means retry.
    fn try_join(
        directory: &Arc<dyn Directory>,
        controller_type: &str,
        max_cas_attempts: u32,
    ) -> ControllerResult<Option<Self>> {
        let records = directory.list(controller_type)?;
        let view = PartitionView::from_records(&records);
        view.validate_coverage()?;
        let assignment = assign_key(&view)?;

        // A rightmost instance that has not yet persisted MAX_KEY would end
        // up below the joiner's key. Wait until it has.
        if let Some(owner) = &assignment.split_owner
            && let Some(owner_record) = records.iter().find(|r| &r.name == owner)
            && assignment.key >= owner_record.controller_key
        {
            debug!(controller_type, split = %owner, "split owner has not adopted MAX_KEY yet");
            return Ok(None);
        }

        let is_first = records.is_empty();
        let name = generate_instance_name(controller_type);
        let mut record = InstanceRecord::new(&name, controller_type, assignment.key, !is_first);
        record.last_heartbeat = epoch_secs();

        match directory.create(&record) {
            Ok(_) => {}
            Err(DirectoryError::AlreadyExists(_)) => {
                warn!(controller = %name, "instance name taken, retrying join");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        // Someone may have claimed the same key between our list and create.
        // Whoever sees a rival withdraws; at least one of any pair does.
        let records = directory.list(controller_type)?;
        if let Some(rival) = records
            .iter()
            .find(|r| r.name != name && r.controller_key == assignment.key)
        {
            warn!(
                controller = %name,
                rival = %rival.name,
                key = assignment.key,
                "key claimed concurrently, withdrawing"
            );
            directory.delete(&name)?;
            return Ok(None);
        }

        let state = if is_first {
            ControllerState::Active
        } else {
            ControllerState::Locked
        };
        let range = KeyRange::new(MIN_KEY, assignment.key);
        let (signal, _) = watch::channel(OwnershipSignal {
            state,
            range,
            halted: false,
        });

        let mut base = Self {
            name,
            controller_type: controller_type.to_string(),
            directory: Arc::clone(directory),
            controller_key: assignment.key,
            range,
            cur_pos: 0,
            view: PartitionView::default(),
            records: BTreeMap::new(),
            state,
            halted: false,
            workload_num: 0,
            max_cas_attempts,
            signal,
        };

        info!(
            controller = %base.name,
            controller_type,
            key = base.controller_key,
            state = %base.state,
            split = ?assignment.split_owner,
            "joined"
        );

        match base.apply_snapshot(records) {
            Ok(()) => {}
            Err(e) if e.is_evicted() => return Err(e),
            Err(e) => warn!(controller = %base.name, error = %e, "initial consolidation failed"),
        }
        Ok(Some(base))
    }

    // ── Directory input ────────────────────────────────────────────

    /// Re-list the directory and consolidate over the full snapshot.
    pub fn resync(&mut self) -> ControllerResult<()> {
        let records = self.directory.list(&self.controller_type)?;
        self.apply_snapshot(records)
    }

    /// Replace the cached snapshot and consolidate.
    pub fn apply_snapshot(&mut self, records: Vec<InstanceRecord>) -> ControllerResult<()> {
        self.records = records
            .into_iter()
            .filter(|r| r.controller_type == self.controller_type)
            .map(|r| (r.name.clone(), r))
            .collect();
        self.on_directory_event()
    }

    /// Fold a single watch event into the cached snapshot and consolidate.
    pub fn apply_event(&mut self, event: DirectoryEvent) -> ControllerResult<()> {
        if event.controller_type() != self.controller_type {
            return Ok(());
        }
        debug!(
            controller = %self.name,
            event = event.kind(),
            record = %event.record().name,
            "directory event"
        );

        match event {
            DirectoryEvent::Added(record) | DirectoryEvent::Updated(record) => {
                if let Some(cached) = self.records.get(&record.name)
                    && cached.version > record.version
                {
                    return Ok(());
                }
                self.records.insert(record.name.clone(), record);
            }
            DirectoryEvent::Deleted(record) => {
                self.records.remove(&record.name);
            }
        }
        self.on_directory_event()
    }

    /// Consolidate the cached snapshot and drive state transitions.
    fn on_directory_event(&mut self) -> ControllerResult<()> {
        let records: Vec<InstanceRecord> = self.records.values().cloned().collect();
        let outcome = match consolidate(&self.view, &records, &self.name) {
            Ok(outcome) => outcome,
            Err(PartitionError::MalformedSnapshot(reason)) => {
                if !self.halted {
                    error!(controller = %self.name, %reason, "malformed snapshot, halting");
                }
                self.halted = true;
                self.publish();
                return Err(PartitionError::MalformedSnapshot(reason).into());
            }
            Err(PartitionError::NotFound(name)) => {
                warn!(controller = %self.name, "own record missing from directory, releasing range");
                self.transition(ControllerState::Locked, "evicted");
                self.publish();
                return Err(PartitionError::NotFound(name).into());
            }
            Err(e) => return Err(e.into()),
        };

        if self.halted {
            info!(controller = %self.name, "snapshot consolidated cleanly, resuming");
            self.halted = false;
        }

        let previous = self.range;
        self.range = outcome.range();
        self.cur_pos = outcome.pos;

        if outcome.is_self_updated {
            debug!(
                controller = %self.name,
                from = %previous,
                to = %self.range,
                pos = self.cur_pos,
                "own range changed"
            );
            if self.state == ControllerState::Active && self.range.lowerbound > previous.lowerbound {
                self.transition(ControllerState::Wait, "lost leading range to a joiner");
            }
        }

        if self.state == ControllerState::Locked {
            let unlocked = self
                .records
                .get(&self.name)
                .is_some_and(|r| !r.is_locked);

            // A live successor may still be sweeping keys this instance now
            // owns; only its unlock releases the lock.
            if unlocked {
                self.transition(ControllerState::Active, "unlocked by successor");
            } else if outcome.is_rightmost() {
                self.transition(ControllerState::Active, "no successor left, self-promoting");
            }
        }

        self.view = outcome.view;
        self.reconcile_own_record();
        self.publish();
        Ok(())
    }

    /// Persist what consolidation decided about this instance's own record.
    ///
    /// An unlocked instance clears its own lock flag after self-promotion,
    /// and the rightmost instance adopts `MAX_KEY`. A deferred write is
    /// retried on the next consolidation.
    fn reconcile_own_record(&mut self) {
        let Some(own) = self.records.get(&self.name) else {
            return;
        };
        let clear_lock = self.state != ControllerState::Locked && own.is_locked;
        let extend = self.range.upperbound == MAX_KEY && own.controller_key != MAX_KEY;
        if !clear_lock && !extend {
            return;
        }

        let result = cas_update(&*self.directory, &self.name, self.max_cas_attempts, |r| {
            if clear_lock {
                r.is_locked = false;
            }
            if extend {
                r.controller_key = MAX_KEY;
            }
        });
        match result {
            Ok(CasOutcome::Vanished) => {}
            Ok(_) => {
                if extend {
                    info!(controller = %self.name, from = self.controller_key, "adopted MAX_KEY as rightmost instance");
                    self.controller_key = MAX_KEY;
                }
            }
            Err(e) => warn!(controller = %self.name, error = %e, "own record write deferred"),
        }
    }

    // ── Workload collaborator ──────────────────────────────────────

    /// Called after a full sweep of the current range.
    ///
    /// Finishes a pending `Wait`, then unlocks the Locked joiner directly
    /// before this instance if it shares this instance's lower bound.
    /// Returns the name of the instance that was unlocked.
    pub fn is_done_processing_current_workloads(&mut self) -> ControllerResult<Option<String>> {
        if self.halted {
            return Err(ControllerError::Halted(self.name.clone()));
        }
        match self.state {
            ControllerState::Locked => return Ok(None),
            ControllerState::Wait => {
                self.transition(ControllerState::Active, "finished sweep over previous range");
                self.publish();
            }
            ControllerState::Active => {}
        }

        let Some(prev_pos) = self.cur_pos.checked_sub(1) else {
            return Ok(None);
        };
        let Some(joiner) = self.view.get(prev_pos) else {
            return Ok(None);
        };
        if !joiner.is_locked || joiner.controller_key != self.range.lowerbound {
            return Ok(None);
        }

        let joiner = joiner.instance_name.clone();
        match cas_update(&*self.directory, &joiner, self.max_cas_attempts, |r| {
            r.is_locked = false
        })? {
            CasOutcome::Written(version) => {
                info!(controller = %self.name, unlocked = %joiner, version, "handed off range");
                Ok(Some(joiner))
            }
            CasOutcome::Unchanged(_) => Ok(None),
            CasOutcome::Vanished => {
                debug!(controller = %self.name, joiner = %joiner, "joiner vanished before unlock");
                Ok(None)
            }
        }
    }

    /// True if `key` falls in this instance's current range, whatever the state.
    pub fn is_in_range(&self, key: ControllerKey) -> bool {
        self.range.contains(key)
    }

    pub fn is_controller_active(&self) -> bool {
        self.state == ControllerState::Active && !self.halted
    }

    /// Record the current workload gauge and push it to the directory.
    pub fn set_workload_num(&mut self, workload_num: u32) -> ControllerResult<()> {
        self.workload_num = workload_num;
        // The next key assignment reads the local view before the write echoes back.
        self.view.set_workload_num(self.cur_pos, workload_num);
        if let Some(own) = self.records.get_mut(&self.name) {
            own.workload_num = workload_num;
        }
        self.write_own(|r| r.workload_num = workload_num)
    }

    /// Refresh the heartbeat and workload gauge in the directory.
    pub fn report_health(&mut self) -> ControllerResult<()> {
        let workload_num = self.workload_num;
        let now = epoch_secs();
        self.write_own(|r| {
            r.workload_num = workload_num;
            r.last_heartbeat = now;
        })
    }

    fn write_own(&mut self, mutation: impl FnMut(&mut InstanceRecord)) -> ControllerResult<()> {
        match cas_update(&*self.directory, &self.name, self.max_cas_attempts, mutation)? {
            CasOutcome::Vanished => Err(PartitionError::NotFound(self.name.clone()).into()),
            CasOutcome::Written(_) | CasOutcome::Unchanged(_) => Ok(()),
        }
    }

    /// Graceful departure: delete the own record so survivors consolidate.
    pub fn leave(&mut self) -> ControllerResult<()> {
        let existed = self.directory.delete(&self.name)?;
        self.transition(ControllerState::Locked, "leaving");
        self.publish();
        info!(controller = %self.name, existed, "left");
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn controller_type(&self) -> &str {
        &self.controller_type
    }

    pub fn controller_key(&self) -> ControllerKey {
        self.controller_key
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn range(&self) -> KeyRange {
        self.range
    }

    pub fn position(&self) -> usize {
        self.cur_pos
    }

    pub fn view(&self) -> &PartitionView {
        &self.view
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn workload_num(&self) -> u32 {
        self.workload_num
    }

    /// The instance expected to unlock this one: its current successor,
    /// while Locked.
    pub fn unlocker(&self) -> Option<&str> {
        if self.state != ControllerState::Locked {
            return None;
        }
        self.view
            .get(self.cur_pos + 1)
            .map(|e| e.instance_name.as_str())
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            name: self.name.clone(),
            controller_type: self.controller_type.clone(),
            controller_key: self.controller_key,
            state: self.state,
            range: self.range,
            pos: self.cur_pos,
            halted: self.halted,
            workload_num: self.workload_num,
            unlocker: self.unlocker().map(str::to_string),
            view: self.view.clone(),
        }
    }

    /// Ownership signal, updated on every change of state, range or halt flag.
    pub fn subscribe(&self) -> watch::Receiver<OwnershipSignal> {
        self.signal.subscribe()
    }

    fn transition(&mut self, to: ControllerState, reason: &str) {
        if self.state == to {
            return;
        }
        info!(
            controller = %self.name,
            controller_type = %self.controller_type,
            from = %self.state,
            to = %to,
            range = %self.range,
            reason,
            "state transition"
        );
        self.state = to;
    }

    fn publish(&self) {
        let next = OwnershipSignal {
            state: self.state,
            range: self.range,
            halted: self.halted,
        };
        self.signal.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
