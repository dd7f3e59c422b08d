use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tdw_storage::{resolve_partition, LocalDocumentStore};
use tdw_sync::{maybe_build_scheduler, LoadPipeline, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tdw-cli")]
#[command(about = "Tariff Data Warehouse loader")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load one partition into the warehouse
    Load(LoadArgs),
    /// Serve the lookup endpoints and the load trigger
    Serve,
    /// Load the previous day's partition on the configured cron
    Schedule,
    /// Land a local document under a partition key in the stage directory
    Stage(StageArgs),
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// Logical partition date, YYYY-MM-DD
    #[arg(long)]
    date: String,
    /// Merge into an in-memory warehouse instead of Postgres
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct StageArgs {
    #[arg(long)]
    date: String,
    #[arg(long)]
    file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Load(args) => {
            let result = tdw_sync::run_load_from_env(&args.date, args.dry_run).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Serve => {
            tdw_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(LoadPipeline::from_config(&config)?);
            let Some(mut sched) = maybe_build_scheduler(&config, pipeline).await? else {
                bail!("scheduler was not built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Stage(args) => {
            let config = SyncConfig::from_env();
            if config.stage_root.starts_with("http://") || config.stage_root.starts_with("https://") {
                bail!("stage root {} is remote; staging needs a local directory", config.stage_root);
            }
            let locator = resolve_partition(Some(&args.date), &config.source_id)?;
            let bytes = tokio::fs::read(&args.file)
                .await
                .with_context(|| format!("reading {}", args.file.display()))?;
            let landed = LocalDocumentStore::new(&config.stage_root)
                .land_bytes(&locator.key, &bytes)
                .await?;
            println!(
                "staged {} ({} bytes, sha256={}, unchanged={})",
                landed.absolute_path.display(),
                landed.byte_size,
                landed.content_hash,
                landed.unchanged
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}
