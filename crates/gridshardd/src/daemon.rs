//! Run mode: join controller instances and keep them coordinating.
//!
//! In this mode, the daemon:
//! 1. Opens the shared directory file
//! 2. Joins the configured number of instances per controller type
//! 3. Runs a coordination loop and an idle sweeper per instance
//! 4. On Ctrl-C, stops the loops; each instance deletes its record

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use gridshard_controller::{
    ControllerBase, ControllerError, ControllerHandle, ControllerResult, ControllerRunner,
    CoordinationSettings,
};
use gridshard_core::GridshardConfig;
use gridshard_directory::{Directory, RedbDirectory};

/// Everything `run` needs, resolved from config and flags.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub directory_path: PathBuf,
    pub settings: CoordinationSettings,
    pub sweep_interval: Duration,
    /// (controller type, instance count)
    pub controllers: Vec<(String, u32)>,
}

impl RunPlan {
    /// Merge the config file with command-line overrides.
    pub fn resolve(
        config: &GridshardConfig,
        data_dir: &Path,
        controller_types: &[String],
        instances: Option<u32>,
    ) -> anyhow::Result<Self> {
        let coordination = config.coordination()?;

        let controllers: Vec<(String, u32)> = if controller_types.is_empty() {
            config
                .controllers
                .iter()
                .map(|c| (c.controller_type.clone(), instances.or(c.instances).unwrap_or(1)))
                .collect()
        } else {
            controller_types
                .iter()
                .map(|t| (t.clone(), instances.unwrap_or(1)))
                .collect()
        };

        anyhow::ensure!(
            !controllers.is_empty(),
            "no controller types configured; pass --controller-type or add [[controllers]]"
        );
        for (controller_type, count) in &controllers {
            anyhow::ensure!(!controller_type.is_empty(), "controller type must not be empty");
            anyhow::ensure!(*count > 0, "{controller_type}: instances must be at least 1");
        }

        Ok(Self {
            directory_path: config.directory_path(data_dir),
            settings: CoordinationSettings::from(&coordination),
            sweep_interval: coordination.sweep_interval,
            controllers,
        })
    }
}

type RunnerTask = (String, JoinHandle<ControllerResult<()>>);

/// Run until Ctrl-C.
pub async fn run(plan: RunPlan) -> anyhow::Result<()> {
    info!("GridShard daemon starting");

    if let Some(parent) = plan.directory_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let directory: Arc<dyn Directory> = Arc::new(RedbDirectory::open(&plan.directory_path)?);
    info!(path = ?plan.directory_path, "directory opened");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut runners: Vec<RunnerTask> = Vec::new();
    let mut sweepers: Vec<JoinHandle<()>> = Vec::new();

    let started = start_instances(&plan, &directory, &shutdown_rx, &mut runners, &mut sweepers).await;
    if let Err(e) = started {
        error!(error = %e, "failed to start controller instances");
        let _ = shutdown_tx.send(true);
        drain(runners, sweepers).await;
        return Err(e.into());
    }
    info!(instances = runners.len(), "controller instances running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    drain(runners, sweepers).await;
    info!("GridShard daemon stopped");
    Ok(())
}

async fn start_instances(
    plan: &RunPlan,
    directory: &Arc<dyn Directory>,
    shutdown: &watch::Receiver<bool>,
    runners: &mut Vec<RunnerTask>,
    sweepers: &mut Vec<JoinHandle<()>>,
) -> ControllerResult<()> {
    for (controller_type, count) in &plan.controllers {
        for _ in 0..*count {
            let base = ControllerBase::join(
                Arc::clone(directory),
                controller_type,
                plan.settings.join_settings(),
            )
            .await?;
            let (handle, task) =
                ControllerRunner::spawn(base, plan.settings.clone(), shutdown.clone());
            sweepers.push(tokio::spawn(run_sweeper(
                handle.clone(),
                plan.sweep_interval,
                shutdown.clone(),
            )));
            runners.push((handle.name().to_string(), task));
        }
    }
    Ok(())
}

async fn drain(runners: Vec<RunnerTask>, sweepers: Vec<JoinHandle<()>>) {
    for sweeper in sweepers {
        let _ = sweeper.await;
    }
    for (name, task) in runners {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(controller = %name, error = %e, "instance stopped with error"),
            Err(e) => warn!(controller = %name, error = %e, "instance task failed"),
        }
    }
}

/// Stand-in for the workload collaborator: every tick counts as a
/// completed sweep, so pending handoffs finish.
async fn run_sweeper(handle: ControllerHandle, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = tick.tick() => match handle.done_processing().await {
                Ok(Some(joiner)) => debug!(controller = %handle.name(), %joiner, "sweep done, joiner unlocked"),
                Ok(None) | Err(ControllerError::Halted(_)) => {}
                Err(e) => warn!(controller = %handle.name(), error = %e, "sweep acknowledgement failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml_str: &str) -> GridshardConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn plan_from_config_file() {
        let config = config(
            r#"
[directory]
path = "/tmp/gs/dir.redb"

[coordination]
sweep_interval = "250ms"

[[controllers]]
controller_type = "cluster"
instances = 3

[[controllers]]
controller_type = "site"
"#,
        );
        let plan = RunPlan::resolve(&config, Path::new("/var/lib/gridshard"), &[], None).unwrap();
        assert_eq!(plan.directory_path, PathBuf::from("/tmp/gs/dir.redb"));
        assert_eq!(plan.sweep_interval, Duration::from_millis(250));
        assert_eq!(
            plan.controllers,
            vec![("cluster".to_string(), 3), ("site".to_string(), 1)]
        );
    }

    #[test]
    fn flags_override_config() {
        let config = config(
            r#"
[[controllers]]
controller_type = "cluster"
instances = 3
"#,
        );
        let plan = RunPlan::resolve(
            &config,
            Path::new("/data"),
            &["site".to_string()],
            Some(2),
        )
        .unwrap();
        assert_eq!(plan.controllers, vec![("site".to_string(), 2)]);
        assert_eq!(plan.directory_path, PathBuf::from("/data/gridshard.redb"));
    }

    #[test]
    fn nothing_to_run_is_an_error() {
        let err = RunPlan::resolve(&GridshardConfig::default(), Path::new("/data"), &[], None);
        assert!(err.is_err());
    }

    #[test]
    fn zero_instances_rejected() {
        let err = RunPlan::resolve(
            &GridshardConfig::default(),
            Path::new("/data"),
            &["cluster".to_string()],
            Some(0),
        );
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn sweeper_completes_handoff() {
        let directory: Arc<dyn Directory> = Arc::new(RedbDirectory::open_in_memory().unwrap());
        let settings = CoordinationSettings {
            resync_interval: Duration::from_millis(100),
            health_interval: Duration::from_millis(100),
            ..CoordinationSettings::default()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let plan = RunPlan {
            directory_path: PathBuf::new(),
            settings,
            sweep_interval: Duration::from_millis(20),
            controllers: vec![("cluster".to_string(), 2)],
        };

        let mut runners = Vec::new();
        let mut sweepers = Vec::new();
        start_instances(&plan, &directory, &shutdown_rx, &mut runners, &mut sweepers)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let records = directory.list("cluster").unwrap();
            if records.len() == 2 && records.iter().all(|r| !r.is_locked) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "handoff never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        drain(runners, sweepers).await;
        assert!(directory.list("cluster").unwrap().is_empty());
    }
}
