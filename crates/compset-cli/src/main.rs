use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use compset_core::Source;
use compset_sync::{maybe_build_scheduler, SyncConfig, SyncPipeline};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "compset")]
#[command(about = "Competitor rate & review tracker")]
struct Cli {
    /// Directory holding hotel_master.json and the published feeds (overrides COMPSET_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Refresh the rolling minimum-price window from Rakuten Travel.
    FetchPrices,
    /// Refresh review average and count per OTA.
    FetchReviews {
        #[arg(long, value_enum)]
        source: Option<SourceArg>,
    },
    /// Write health_report.json from the current feeds.
    Health,
    /// Serve a read-only preview of the feeds.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Run the daily price and weekly review jobs in-process until interrupted.
    Schedule,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Rakuten,
    Jalan,
}

impl From<SourceArg> for Source {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Rakuten => Source::Rakuten,
            SourceArg::Jalan => Source::Jalan,
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("rendering summary")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config = config.with_data_dir(dir);
    }

    match cli.command {
        Commands::FetchPrices => {
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_prices().await?;
            print_json(&summary)?;
        }
        Commands::FetchReviews { source } => {
            let sources: Vec<Source> = match source {
                Some(source) => vec![source.into()],
                None => Source::ALL.to_vec(),
            };
            let pipeline = SyncPipeline::new(config)?;
            let summary = pipeline.run_reviews(&sources).await?;
            print_json(&summary)?;
        }
        Commands::Health => {
            let pipeline = SyncPipeline::new(config)?;
            let report = pipeline.run_health().await?;
            print_json(&report.summary)?;
        }
        Commands::Serve { port } => {
            compset_web::serve(compset_web::AppState::from_config(&config), port).await?;
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut sched) = maybe_build_scheduler(pipeline.clone()).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                prices = %pipeline.config().price_cron,
                reviews = %pipeline.config().review_cron,
                "scheduler running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
