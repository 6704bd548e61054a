//! Coordination runner: one background task per controller instance.
//!
//! The task serializes everything that touches a [`ControllerBase`]:
//! directory events are applied one at a time, interleaved with periodic
//! resyncs and health reports. Workload code talks to the instance
//! through a cloneable [`ControllerHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{error, info, warn};

use gridshard_core::{ControllerKey, config::ResolvedCoordination};
use gridshard_directory::{DirectoryWatch, WatchError};

use crate::base::{ControllerBase, ControllerSnapshot, JoinSettings};
use crate::error::ControllerResult;
use crate::liveness::{epoch_secs, reap_expired};
use crate::state::OwnershipSignal;

/// Timing and retry bounds for a running instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationSettings {
    pub resync_interval: Duration,
    pub health_interval: Duration,
    /// Reap peers whose heartbeat is older than this. `None` disables reaping.
    pub heartbeat_ttl: Option<Duration>,
    pub max_cas_attempts: u32,
    pub max_join_attempts: u32,
    pub join_backoff: Duration,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self::from(&ResolvedCoordination::default())
    }
}

impl From<&ResolvedCoordination> for CoordinationSettings {
    fn from(c: &ResolvedCoordination) -> Self {
        Self {
            resync_interval: c.resync_interval,
            health_interval: c.health_interval,
            heartbeat_ttl: c.heartbeat_ttl,
            max_cas_attempts: c.max_cas_attempts,
            max_join_attempts: c.max_join_attempts,
            join_backoff: Duration::from_millis(50),
        }
    }
}

impl CoordinationSettings {
    pub fn join_settings(&self) -> JoinSettings {
        JoinSettings {
            max_join_attempts: self.max_join_attempts,
            max_cas_attempts: self.max_cas_attempts,
            backoff: self.join_backoff,
        }
    }
}

/// Cloneable access to a running instance.
#[derive(Clone)]
pub struct ControllerHandle {
    name: String,
    base: Arc<RwLock<ControllerBase>>,
    signal: watch::Receiver<OwnershipSignal>,
}

impl ControllerHandle {
    fn new(base: ControllerBase) -> Self {
        Self {
            name: base.name().to_string(),
            signal: base.subscribe(),
            base: Arc::new(RwLock::new(base)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_in_range(&self, key: ControllerKey) -> bool {
        self.base.read().await.is_in_range(key)
    }

    pub async fn is_controller_active(&self) -> bool {
        self.base.read().await.is_controller_active()
    }

    /// Report a finished sweep. Returns the instance unlocked, if any.
    pub async fn done_processing(&self) -> ControllerResult<Option<String>> {
        self.base.write().await.is_done_processing_current_workloads()
    }

    pub async fn set_workload_num(&self, workload_num: u32) -> ControllerResult<()> {
        self.base.write().await.set_workload_num(workload_num)
    }

    pub async fn report_health(&self) -> ControllerResult<()> {
        self.base.write().await.report_health()
    }

    pub async fn snapshot(&self) -> ControllerSnapshot {
        self.base.read().await.snapshot()
    }

    /// Latest ownership signal without waiting.
    pub fn current_signal(&self) -> OwnershipSignal {
        *self.signal.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<OwnershipSignal> {
        self.signal.clone()
    }
}

/// Spawns the coordination loop for a joined instance.
pub struct ControllerRunner;

impl ControllerRunner {
    /// Start the loop. It runs until `shutdown` flips, then deletes the
    /// instance's record. It exits early with an error if the record is
    /// removed by someone else.
    pub fn spawn(
        base: ControllerBase,
        settings: CoordinationSettings,
        shutdown: watch::Receiver<bool>,
    ) -> (ControllerHandle, JoinHandle<ControllerResult<()>>) {
        // Subscribe before the first resync so no change slips between them.
        let events = base.directory().watch(base.controller_type());
        let handle = ControllerHandle::new(base);
        let task = tokio::spawn(run(handle.clone(), events, settings, shutdown));
        (handle, task)
    }
}

async fn run(
    handle: ControllerHandle,
    mut events: DirectoryWatch,
    settings: CoordinationSettings,
    mut shutdown: watch::Receiver<bool>,
) -> ControllerResult<()> {
    let name = handle.name().to_string();
    info!(controller = %name, controller_type = %events.controller_type(), "coordination loop started");

    if let Err(e) = resync(&handle, &mut events).await {
        if e.is_evicted() {
            return Err(e);
        }
        warn!(controller = %name, error = %e, "initial resync failed");
    }

    let start = Instant::now();
    let mut resync_tick = interval_at(start + settings.resync_interval, settings.resync_interval);
    let mut health_tick = interval_at(start + settings.health_interval, settings.health_interval);

    loop {
        let result = tokio::select! {
            event = events.recv() => match event {
                Ok(event) => handle.base.write().await.apply_event(event),
                Err(WatchError::Lagged(missed)) => {
                    warn!(controller = %name, missed, "directory watch lagged, re-listing");
                    resync(&handle, &mut events).await
                }
                Err(WatchError::Closed) => {
                    warn!(controller = %name, "directory watch closed");
                    break;
                }
            },
            _ = resync_tick.tick() => resync(&handle, &mut events).await,
            _ = health_tick.tick() => health(&handle, &settings).await,
            _ = shutdown.changed() => {
                info!(controller = %name, "coordination loop shutting down");
                break;
            }
        };

        if let Err(e) = result {
            if e.is_evicted() {
                error!(controller = %name, "own record removed from directory, stopping");
                return Err(e);
            }
            warn!(controller = %name, error = %e, "coordination step failed, retrying next cycle");
        }
    }

    handle.base.write().await.leave()
}

/// Discard queued events, then consolidate over a fresh list.
async fn resync(handle: &ControllerHandle, events: &mut DirectoryWatch) -> ControllerResult<()> {
    loop {
        match events.try_recv() {
            Ok(Some(_)) | Err(WatchError::Lagged(_)) => continue,
            Ok(None) | Err(WatchError::Closed) => break,
        }
    }
    handle.base.write().await.resync()
}

async fn health(handle: &ControllerHandle, settings: &CoordinationSettings) -> ControllerResult<()> {
    let mut base = handle.base.write().await;
    base.report_health()?;

    if let Some(ttl) = settings.heartbeat_ttl {
        let reaped = reap_expired(
            base.directory().as_ref(),
            base.controller_type(),
            base.name(),
            ttl,
            epoch_secs(),
        )?;
        if !reaped.is_empty() {
            info!(controller = %base.name(), count = reaped.len(), "reaped expired peers");
        }
    }
    Ok(())
}
