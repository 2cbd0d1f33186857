use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use camsync::config::AppConfig;
use camsync::context::AppContext;
use camsync::core::{
    CopyExecutor, CopyMode, Orchestrator, diff_trees, format_size, plan_copy, scan_marker_folders,
};
use camsync::{adapters, logging};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "camsync")]
#[command(about = "Back up camera memory cards as they are plugged in", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    overrides: ConfigArgs,
}

/// Command-line values layered over the file and environment config.
#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    backup_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    simulation: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, short, global = true)]
    verbose: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for camera cards and back them up on arrival
    Watch,
    /// List the camera folders found on a volume
    Scan { volume: PathBuf },
    /// Show which files a copy would transfer
    Plan(TransferArgs),
    /// Compare two folder trees
    Diff { source: PathBuf, destination: PathBuf },
    /// Copy a folder tree, skipping files already present
    Copy(TransferArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct TransferArgs {
    source: PathBuf,
    destination: PathBuf,

    /// Copy every file instead of only new or changed ones
    #[arg(long)]
    full: bool,
}

impl TransferArgs {
    fn mode(&self) -> CopyMode {
        CopyMode::from(!self.full)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(Some(&cli.overrides))?;
    logging::init(logging::LogConfig::from(&config))?;

    match cli.command {
        Commands::Watch => run_watch(config).await.context("Watcher failed")?,
        Commands::Scan { volume } => run_scan(&config, &volume),
        Commands::Plan(args) => run_plan(&args)?,
        Commands::Diff {
            source,
            destination,
        } => run_diff(&source, &destination)?,
        Commands::Copy(args) => run_copy(&args).await?,
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "Unable to listen for Ctrl-C"),
        }
    });
}

async fn run_watch(config: AppConfig) -> Result<()> {
    let enumerator = adapters::get_enumerator(config.simulation);
    let orchestrator = Orchestrator::new(AppContext::new(config));

    // Also interrupts a copy that is already running
    cancel_on_ctrl_c(orchestrator.shutdown_token());

    orchestrator.run(enumerator).await
}

fn run_scan(config: &AppConfig, volume: &Path) {
    let folders = scan_marker_folders(volume, &config.marker_folders);
    if folders.is_empty() {
        println!("No camera folders found on {}", volume.display());
        return;
    }

    for folder in folders {
        println!(
            "{:<10} {:>8} files {:>12}",
            folder.name,
            folder.file_count,
            format_size(folder.total_bytes)
        );
    }
}

fn run_plan(args: &TransferArgs) -> Result<()> {
    let set = plan_copy(&args.source, &args.destination, args.mode())?;

    for item in &set {
        let relative = item.source.strip_prefix(&args.source).unwrap_or(&item.source);
        println!("{:>12}  {}", format_size(item.size), relative.display());
    }
    println!("{} file(s), {}", set.len(), format_size(set.total_bytes()));
    Ok(())
}

fn run_diff(source: &Path, destination: &Path) -> Result<()> {
    let report = diff_trees(source, destination)?;

    if report.is_identical() {
        println!("Trees are identical");
        return Ok(());
    }

    for path in &report.source_only {
        println!("+ {}", path.display());
    }
    for path in &report.dest_only {
        println!("- {}", path.display());
    }
    for path in &report.changed {
        println!("~ {}", path.display());
    }
    println!("Size difference: {} bytes", report.size_delta);
    Ok(())
}

async fn run_copy(args: &TransferArgs) -> Result<()> {
    let set = plan_copy(&args.source, &args.destination, args.mode())?;
    println!(
        "Copying {} file(s), {}",
        set.len(),
        format_size(set.total_bytes())
    );

    let (tx, mut rx) = mpsc::channel(64);
    let handle = CopyExecutor::new().spawn(set, tx)?;
    cancel_on_ctrl_c(handle.cancellation_token());

    while let Some(progress) = rx.recv().await {
        println!("[{}/{}] {}", progress.done, progress.total, progress.current);
    }

    let outcome = handle.wait().await;
    println!("{}", outcome.message);

    if !outcome.success {
        anyhow::bail!("Copy did not complete");
    }
    Ok(())
}
