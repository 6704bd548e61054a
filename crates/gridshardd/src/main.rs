//! gridshardd: the GridShard daemon.
//!
//! Runs one or more controller instances per controller type against a
//! shared directory file. Each instance joins, takes part in range
//! handoffs, and deletes its record on shutdown.
//!
//! # Usage
//!
//! ```text
//! gridshardd init > gridshard.toml
//! gridshardd run --config gridshard.toml --data-dir /var/lib/gridshard
//! gridshardd run --controller-type cluster --instances 3
//! gridshardd status --data-dir /var/lib/gridshard --controller-type cluster
//! gridshardd status --controller-type cluster --item us-east-1
//! ```

mod daemon;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gridshard_core::GridshardConfig;

const DEFAULT_FILTER: &str = "info,gridshardd=debug,gridshard=debug";

#[derive(Parser)]
#[command(name = "gridshardd", about = "GridShard daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run controller instances until interrupted.
    Run {
        /// Path to gridshard.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory holding the directory file.
        #[arg(long, default_value = "/var/lib/gridshard")]
        data_dir: PathBuf,

        /// Controller types to run (overrides the config file).
        #[arg(long = "controller-type")]
        controller_types: Vec<String>,

        /// Instances per controller type (overrides the config file).
        #[arg(long)]
        instances: Option<u32>,
    },

    /// Print the partition table of a controller type as JSON.
    Status {
        /// Path to gridshard.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory holding the directory file.
        #[arg(long, default_value = "/var/lib/gridshard")]
        data_dir: PathBuf,

        /// Controller type to inspect. All types if omitted.
        #[arg(long)]
        controller_type: Option<String>,

        /// Also show which instance owns this workload item.
        #[arg(long)]
        item: Option<String>,
    },

    /// Print a scaffold gridshard.toml.
    Init {
        /// Controller types to include.
        #[arg(long = "controller-type", default_values_t = vec!["cluster".to_string()])]
        controller_types: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            controller_types,
            instances,
        } => {
            let config = load_config(config.as_deref())?;
            let plan = daemon::RunPlan::resolve(&config, &data_dir, &controller_types, instances)?;
            daemon::run(plan).await
        }
        Command::Status {
            config,
            data_dir,
            controller_type,
            item,
        } => {
            let config = load_config(config.as_deref())?;
            let path = config.directory_path(&data_dir);
            let report = status::collect(&path, controller_type.as_deref(), item.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Init { controller_types } => {
            let types: Vec<&str> = controller_types.iter().map(String::as_str).collect();
            print!("{}", GridshardConfig::scaffold(&types).to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<GridshardConfig> {
    match path {
        Some(path) => GridshardConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display())),
        None => Ok(GridshardConfig::default()),
    }
}
