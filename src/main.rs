//! dallepd-rs: incremental downloader for generated-image task history.
//!
//! Pages through the labs task history newest first until it reaches the
//! checkpoint left by the previous run, then materializes every new record
//! as optimized PNG files, oldest timestamp first. The checkpoint advances
//! after each fully written timestamp group, so an interrupted run resumes
//! where it stopped.

#![warn(clippy::all)]

mod checkpoint;
mod cli;
mod config;
mod download;
mod feed;
pub mod retry;
mod scan;
mod shutdown;
mod sync;
mod types;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use checkpoint::{CheckpointStore, DirectoryLock, FileCheckpoint};
use cli::Command;
use download::caption::{CaptionTagger, ExifTool, NoCaption};
use download::fetch::HttpAssetSource;
use download::Materializer;
use feed::LabsClient;
use scan::Scanner;
use sync::{SyncConfig, SyncEngine, SyncError};

/// Run the status command.
async fn run_status(args: cli::DirectoryArgs) -> anyhow::Result<()> {
    let directory = config::expand_tilde(&args.directory);
    let checkpoint = FileCheckpoint::new(&directory);

    if !checkpoint.path().exists() {
        println!("No checkpoint found at {}", checkpoint.path().display());
        println!("The next sync downloads the full history.");
        return Ok(());
    }

    let timestamp = checkpoint.load().await?;
    println!("Checkpoint: {}", checkpoint.path().display());
    println!("  Timestamp: {}", timestamp);
    if let Some(local) = Local.timestamp_opt(timestamp, 0).single() {
        println!("  Local time: {}", local.format("%Y-%m-%d %H:%M:%S"));
    }

    Ok(())
}

/// Run the reset command.
async fn run_reset(args: cli::ResetArgs) -> anyhow::Result<()> {
    let directory = config::expand_tilde(&args.dir.directory);
    let checkpoint = FileCheckpoint::new(&directory);

    if !checkpoint.path().exists() {
        println!("No checkpoint found at {}", checkpoint.path().display());
        return Ok(());
    }

    if !args.yes {
        println!("This will delete the checkpoint at:");
        println!("  {}", checkpoint.path().display());
        println!("The next sync will download the full history again.");
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let _lock = DirectoryLock::acquire(&directory)?;
    if checkpoint.reset().await? {
        println!("Checkpoint deleted.");
    }

    Ok(())
}

fn build_engine(config: &config::Config) -> anyhow::Result<SyncEngine> {
    let client = LabsClient::new(&config.base_url, &config.auth_token)?;
    let assets = Arc::new(HttpAssetSource::new(client.http_client()));

    let tagger: Arc<dyn CaptionTagger> = if config.no_caption {
        Arc::new(NoCaption)
    } else {
        Arc::new(ExifTool::new(&config.exiftool))
    };

    let concurrency = config.threads_num as usize;
    let materializer = Materializer::new(
        assets,
        tagger,
        config.directory.clone(),
        config.backoff,
    )
    .with_concurrency(concurrency)
    .with_dry_run(config.dry_run);

    let scanner = Scanner::new(Arc::new(client), config.page_size);
    let checkpoint = Arc::new(FileCheckpoint::new(&config.directory));

    Ok(SyncEngine::new(
        scanner,
        materializer,
        checkpoint,
        SyncConfig {
            concurrency,
            dry_run: config.dry_run,
            no_progress_bar: config.no_progress_bar,
        },
    ))
}

fn ensure_directory(directory: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(directory).map_err(|e| {
        anyhow::anyhow!(
            "Cannot create download directory {}: {}",
            directory.display(),
            e
        )
    })
}

/// Run the sync command, once or in watch mode.
async fn run_sync(args: cli::SyncArgs) -> anyhow::Result<()> {
    let config = config::Config::from_cli(args)?;
    tracing::debug!(?config, "Resolved configuration");
    tracing::info!(
        concurrency = config.threads_num,
        directory = %config.directory.display(),
        "Starting dallepd-rs"
    );

    ensure_directory(&config.directory)?;
    let lock = DirectoryLock::acquire(&config.directory)?;
    tracing::debug!("Holding {} for the duration of the sync", lock.path().display());

    let engine = build_engine(&config)?;
    let shutdown_token = shutdown::install_signal_handler()?;

    loop {
        if shutdown_token.is_cancelled() {
            tracing::info!("Shutdown requested, exiting...");
            break;
        }

        let summary = engine.run(shutdown_token.clone()).await?;
        if summary.interrupted {
            break;
        }

        if let Some(interval) = config.watch_with_interval {
            tracing::info!("Waiting {} seconds...", interval);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Shutdown during wait, exiting...");
                    break;
                }
            }
        } else {
            break;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let result = match cli.effective_command() {
        Command::Status(args) => run_status(args).await,
        Command::Reset(args) => run_reset(args).await,
        Command::Sync(args) => run_sync(args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            let code = e
                .downcast_ref::<SyncError>()
                .map(SyncError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
