mod simulate;

use clap::{Parser, Subcommand};
use fleet_checkpoint::{CheckpointOptions, CheckpointStore};
use fleet_core::FleetConfig;
use simulate::SimulationParams;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "fleet.toml";

#[derive(Parser)]
#[command(name = "fleet", about = "Fleet: resilient task distribution for agent fleets")]
struct Cli {
    /// Path to config file (defaults to ./fleet.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and maintain stored checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run an in-process simulation of dispatch, retries and checkpointing
    Simulate {
        #[arg(long, default_value_t = 2)]
        tenants: usize,
        #[arg(long, default_value_t = 20)]
        tasks: usize,
        #[arg(long, default_value_t = 3)]
        agents: usize,
        /// Percentage of attempts that fail
        #[arg(long, default_value_t = 20)]
        failure_percent: u8,
        #[arg(long, default_value_t = 20)]
        max_rounds: usize,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoints, newest first
    List {
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Print a checkpoint's metadata and state
    Show { id: String },
    /// Verify stored hashes (all checkpoints when no id is given)
    Verify { id: Option<String> },
    /// Delete old checkpoints for a workflow and orphaned blobs
    Prune {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        workflow: String,
        /// Checkpoints to keep (defaults to checkpoint.keep)
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the config and print the effective values
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Checkpoints { action } => {
            let store = open_store(&config).await?;
            match action {
                CheckpointAction::List { agent, workflow } => {
                    let found = store
                        .list_checkpoints(agent.as_deref(), workflow.as_deref())
                        .await;
                    if found.is_empty() {
                        println!("No checkpoints found in {}", config.checkpoint_dir().display());
                    } else {
                        for meta in &found {
                            println!(
                                "{}  {}  {}/{}  {} bytes{}",
                                meta.checkpoint_id,
                                meta.timestamp.to_rfc3339(),
                                meta.agent_id,
                                meta.workflow_id,
                                meta.size_bytes,
                                if meta.compressed { " (zlib)" } else { "" }
                            );
                        }
                        println!("\nTotal: {} checkpoint(s)", found.len());
                    }
                }
                CheckpointAction::Show { id } => {
                    let meta = store
                        .metadata(&id)
                        .await
                        .ok_or_else(|| anyhow::anyhow!("Checkpoint '{id}' not found"))?;
                    let state = store.load_checkpoint(&id).await?;
                    let doc = serde_json::json!({ "metadata": meta, "state": state });
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
                CheckpointAction::Verify { id } => {
                    let ids = match id {
                        Some(id) => vec![id],
                        None => store
                            .list_checkpoints(None, None)
                            .await
                            .into_iter()
                            .map(|m| m.checkpoint_id)
                            .collect(),
                    };
                    let mut bad = 0;
                    for id in &ids {
                        let ok = store.verify_checkpoint(id).await?;
                        if !ok {
                            bad += 1;
                        }
                        println!("{}  {}", if ok { "ok      " } else { "MISMATCH" }, id);
                    }
                    if bad > 0 {
                        anyhow::bail!("{bad} of {} checkpoint(s) failed verification", ids.len());
                    }
                }
                CheckpointAction::Prune {
                    agent,
                    workflow,
                    keep,
                } => {
                    let keep = keep.unwrap_or(config.checkpoint.keep);
                    let deleted = store.cleanup_old_checkpoints(&agent, &workflow, keep).await?;
                    let orphans = store.prune_orphans().await?;
                    println!("Deleted {deleted} old checkpoint(s) and {orphans} orphaned blob(s)");
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Check => {
                config.validate()?;
                println!("{}", toml::to_string_pretty(&config)?);
            }
        },
        Commands::Simulate {
            tenants,
            tasks,
            agents,
            failure_percent,
            max_rounds,
        } => {
            let params = SimulationParams {
                tenants,
                tasks,
                agents,
                failure_percent,
                max_rounds,
            };
            info!(?params, "starting simulation");
            let summary = simulate::run(&config, &params).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    let path = match path {
        Some(path) => path,
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if !default.exists() {
                warn!("no {DEFAULT_CONFIG} found, using built-in defaults");
                return Ok(FleetConfig::default());
            }
            default
        }
    };
    Ok(FleetConfig::load(path).await?)
}

async fn open_store(config: &FleetConfig) -> anyhow::Result<CheckpointStore> {
    let dir = config.checkpoint_dir();
    let store = CheckpointStore::open_dir(&dir, CheckpointOptions::from(&config.checkpoint)).await?;
    Ok(store)
}
