//! Device State Orchestrator - operator CLI
//!
//! Connects to configured devices over SSH, detects their filesystem
//! layout, and installs or removes activation state with a snapshot taken
//! before every mutation.

#![forbid(unsafe_code)]

mod commands;
mod output;
mod progress;
mod ssh;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dso_common::{CancelFlag, LogConfig, init_logging, load_config};
use tracing::{debug, error};

use commands::DeviceContext;
use output::OutputContext;

#[derive(Parser)]
#[command(name = "dso")]
#[command(author, version, about = "Device state orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.config/dso/config.toml)
    #[arg(short, long, global = true, env = "DSO_CONFIG")]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices from the config file
    Devices,

    /// Detect which filesystem layout a device uses
    Detect {
        /// Device alias, id or host
        device: String,
    },

    /// Show what an install would touch without changing anything
    Plan {
        device: String,
    },

    /// Snapshot the device, then install artifacts from a directory
    Run {
        device: String,

        /// Directory holding one file per artifact, named by logical name
        #[arg(short, long)]
        artifacts: PathBuf,

        /// Upload artifacts one at a time
        #[arg(long)]
        sequential: bool,
    },

    /// Snapshot the device, then remove installed activation state
    Decommission {
        device: String,
    },

    /// Write a stored snapshot back to the device
    Restore {
        device: String,

        /// Snapshot id as shown by `dso snapshots list`
        snapshot: String,
    },

    /// Manage local snapshots
    Snapshots {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Show recent runs
    History {
        /// Only runs against this device
        #[arg(short, long)]
        device: Option<String>,

        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// List snapshots, newest first
    List {
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Delete all but the most recent snapshots
    Prune {
        /// How many to keep (defaults to snapshot.keep)
        #[arg(short, long)]
        keep: Option<usize>,

        /// Only prune this device's snapshots
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Delete one snapshot
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration and where each value came from
    Show,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let loaded = load_config(cli.config.as_deref())?;
    match &loaded.file {
        Some(path) => debug!(path = %path.display(), "Loaded config"),
        None => debug!("No config file, using defaults"),
    }

    let out = OutputContext::new(cli.json);
    let cancel = CancelFlag::new();
    let ctx = DeviceContext {
        config: &loaded.config,
        out,
        cancel: cancel.clone(),
    };

    let outcome = match cli.command {
        Commands::Devices => commands::devices(&ctx),
        Commands::Detect { device } => commands::detect(&ctx, &device).await,
        Commands::Plan { device } => commands::plan(&ctx, &device).await,
        Commands::Run {
            device,
            artifacts,
            sequential,
        } => {
            commands::install_interrupt_handler(cancel);
            commands::run(&ctx, &device, &artifacts, sequential).await
        }
        Commands::Decommission { device } => {
            commands::install_interrupt_handler(cancel);
            commands::decommission(&ctx, &device).await
        }
        Commands::Restore { device, snapshot } => {
            commands::install_interrupt_handler(cancel);
            commands::restore(&ctx, &device, &snapshot).await
        }
        Commands::Snapshots { action } => match action {
            SnapshotAction::List { device } => commands::snapshots_list(&ctx, device.as_deref()),
            SnapshotAction::Prune { keep, device } => {
                commands::snapshots_prune(&ctx, keep, device.as_deref())
            }
            SnapshotAction::Delete { id } => commands::snapshots_delete(&ctx, &id),
        },
        Commands::History { device, limit } => commands::history(&ctx, device.as_deref(), limit),
        Commands::Config {
            action: ConfigAction::Show,
        } => commands::config_show(out, &loaded),
    };

    match outcome {
        Ok(true) => Ok(ExitCode::SUCCESS),
        Ok(false) => Ok(ExitCode::FAILURE),
        Err(err) => {
            error!("{err:#}");
            if out.is_json() {
                out.json("error", false, serde_json::json!({ "error": format!("{err:#}") }))?;
            } else {
                eprintln!("{} {err:#}", console::style("error:").red().bold());
            }
            Ok(ExitCode::from(2))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_requires_artifacts() {
        assert!(Cli::try_parse_from(["dso", "run", "lab"]).is_err());
        let cli = Cli::try_parse_from(["dso", "run", "lab", "-a", "/tmp/art", "--sequential"])
            .unwrap();
        match cli.command {
            Commands::Run {
                device,
                artifacts,
                sequential,
            } => {
                assert_eq!(device, "lab");
                assert_eq!(artifacts, PathBuf::from("/tmp/art"));
                assert!(sequential);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["dso", "snapshots", "prune", "--keep", "3", "--json"])
            .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Snapshots {
                action: SnapshotAction::Prune { keep, device },
            } => {
                assert_eq!(keep, Some(3));
                assert!(device.is_none());
            }
            _ => panic!("expected snapshots prune"),
        }
    }

    #[test]
    fn test_history_defaults() {
        let cli = Cli::try_parse_from(["dso", "history"]).unwrap();
        match cli.command {
            Commands::History { device, limit } => {
                assert!(device.is_none());
                assert_eq!(limit, 20);
            }
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn test_restore_takes_device_and_snapshot() {
        let cli =
            Cli::try_parse_from(["dso", "restore", "lab", "lab-20240101T000000000Z"]).unwrap();
        assert!(matches!(cli.command, Commands::Restore { .. }));
    }
}
