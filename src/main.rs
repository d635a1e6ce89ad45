use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waypoint_core::config::AppConfig;
use waypoint_core::types::{CheckpointData, ExecutionStatus};
use waypoint_workflow::CheckpointStore;

#[derive(Parser)]
#[command(name = "waypoint", version, about = "Inspect and maintain workflow checkpoints")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "waypoint.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved configuration
    Config,
    /// List the checkpoints of an execution, oldest first
    Checkpoints {
        execution_id: String,
        /// Only checkpoints whose state has this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Print one checkpoint as JSON
    Show { checkpoint_id: String },
    /// Print the newest checkpoint of an execution
    Latest {
        execution_id: String,
        /// Only consider checkpoints that can be resumed
        #[arg(long)]
        resumable: bool,
    },
    /// Delete one checkpoint
    Delete { checkpoint_id: String },
    /// Delete checkpoints older than the retention window
    Cleanup {
        /// Retention in days (default: checkpoint.retention_days)
        #[arg(long)]
        days: Option<i64>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("waypoint=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let store = CheckpointStore::from_config(&config)?;

    match cli.command {
        Commands::Config => {}
        Commands::Checkpoints {
            execution_id,
            status,
        } => {
            let status = status
                .as_deref()
                .map(str::parse::<ExecutionStatus>)
                .transpose()?;
            let checkpoints = store.list_checkpoints(&execution_id, status)?;
            if checkpoints.is_empty() {
                println!("No checkpoints for {}", execution_id);
            }
            for cp in &checkpoints {
                print_summary(cp);
            }
        }
        Commands::Show { checkpoint_id } => {
            let cp = store.load_checkpoint(&checkpoint_id)?;
            println!("{}", serde_json::to_string_pretty(&cp)?);
        }
        Commands::Latest {
            execution_id,
            resumable,
        } => {
            let latest = if resumable {
                store.get_latest_resumable(&execution_id)?
            } else {
                store.get_latest_checkpoint(&execution_id)?
            };
            match latest {
                Some(cp) => println!("{}", serde_json::to_string_pretty(&cp)?),
                None => println!("No checkpoints for {}", execution_id),
            }
        }
        Commands::Delete { checkpoint_id } => {
            if store.delete_checkpoint(&checkpoint_id)? {
                println!("Deleted {}", checkpoint_id);
            } else {
                println!("No checkpoint {}", checkpoint_id);
            }
        }
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.checkpoint.retention_days as i64);
            if days < 0 {
                anyhow::bail!("--days must not be negative");
            }
            let deleted = store.cleanup_old(chrono::Duration::days(days))?;
            info!(deleted, days, "Checkpoint cleanup finished");
            println!("Deleted {} checkpoints older than {} days", deleted, days);
        }
    }

    Ok(())
}

/// Explicit path first, then `~/.waypoint/waypoint.toml`, then defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home_config) = dirs_home().map(|h| h.join(".waypoint").join("waypoint.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn print_summary(cp: &CheckpointData) {
    println!(
        "{}  {}  {:<10} step={:<16} resumable={}  {}/{} steps",
        cp.checkpoint_id,
        cp.created_at.format("%Y-%m-%d %H:%M:%S"),
        cp.state.status.as_str(),
        cp.step_id,
        cp.can_resume,
        cp.state.completed_steps,
        cp.state.total_steps,
    );
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
