use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uploader_storage::{format_watermark, WatermarkStore};
use uploader_sync::{build_scheduler, SyncConfig, Uploader};

#[derive(Debug, Parser)]
#[command(name = "daily-uploader")]
#[command(about = "Upload daily time-tracking exports to Supabase")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and print its summary as JSON
    Run,
    /// Run ingestion on DAILY_UPLOADER_CRON until interrupted
    Watch,
    /// Parse an export file and print the result as JSON
    Parse { file: PathBuf },
    /// Print the stored watermark without initialising it
    Watermark,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Parse { file } => {
            init_logging(None)?;
            let parsed = uploader_export::parse_export_file(&file)
                .with_context(|| format!("parsing {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&parsed)?);
        }
        Commands::Watermark => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            init_logging(None)?;
            let watermark = WatermarkStore::new(&config.watermark_file);
            match watermark.peek().await? {
                Some(at) => println!("{}", format_watermark(at)),
                None => println!("no watermark at {}", watermark.path().display()),
            }
        }
        Commands::Run => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            init_logging(Some(&config.log_file()))?;
            let uploader = Uploader::connect(config).context("building store client")?;
            let summary = uploader.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Watch => {
            let config = SyncConfig::from_env().context("loading configuration")?;
            init_logging(Some(&config.log_file()))?;
            let uploader = Arc::new(Uploader::connect(config).context("building store client")?);
            let Some(mut sched) = build_scheduler(uploader).await? else {
                anyhow::bail!("watch requires DAILY_UPLOADER_CRON to be set");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler started; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}

/// Stderr logging, plus an append-only plain-text copy when `log_file` is set.
fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let file_layer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("creating log directory {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;
    Ok(())
}
