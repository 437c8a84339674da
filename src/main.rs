// =============================================================================
// Candle Ledger — Main Entry Point
// =============================================================================
//
// `serve` (default) runs the HTTP API; `ingest` runs one ingestion batch and
// exits. Scheduling is left to cron or whatever calls `POST /api/v1/ingest`.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod error;
mod ingest;
mod live;
mod market_data;
mod query;
mod runtime_config;
mod store;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::ingest::IngestStatus;
use crate::market_data::IssClient;
use crate::runtime_config::RuntimeConfig;

#[derive(Parser)]
#[command(name = "candle-ledger", about = "OHLCV candle ingestion and query service")]
struct Cli {
    /// JSON config file; missing file means built-in defaults.
    #[arg(long, default_value = "candle_ledger.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the HTTP API
    Serve,
    /// Ingest candles for configured instruments once, then exit
    Ingest(IngestArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct IngestArgs {
    /// Only this instrument (must be configured).
    #[arg(long)]
    ticker: Option<String>,

    /// Interval code: 1, 10, 60, 24, 7 or 31.
    #[arg(long)]
    interval: Option<u32>,

    /// Reload the full lookback instead of resuming after the last candle.
    #[arg(long)]
    all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = RuntimeConfig::load(&cli.config).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();
    config.validate().context("invalid runtime config")?;

    info!(
        instruments = ?config.instruments,
        data_dir = %config.data_dir.display(),
        upstream = %config.iss_base_url,
        "Configured candle ledger"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let client = Arc::new(IssClient::new(config.iss_settings())?);
    let state = Arc::new(AppState::new(config, client));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state).await,
        Command::Ingest(args) => ingest_once(&state, args).await,
    }
}

async fn serve(state: Arc<AppState>) -> Result<()> {
    let bind_addr = state.config.bind_addr.clone();
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            warn!("Shutdown signal received, stopping gracefully");
        })
        .await
        .context("API server failed")?;

    info!("Candle ledger shut down complete.");
    Ok(())
}

async fn ingest_once(state: &AppState, args: IngestArgs) -> Result<()> {
    let granularity = match state.granularity_or_default(args.interval) {
        Ok(g) => g,
        Err(code) => bail!("unsupported interval {code}"),
    };
    let instruments = match args.ticker.as_deref() {
        Some(raw) => match state.known_instrument(raw) {
            Some(inst) => vec![inst],
            None => bail!("instrument {raw:?} is not configured"),
        },
        None => state.config.instruments.clone(),
    };

    let report = state
        .pipeline
        .run_batch(&instruments, granularity, args.all)
        .await;

    for line in &report.instruments {
        match &line.status {
            IngestStatus::Inserted { count } => {
                info!(instrument = %line.instrument, inserted = count, "ingested")
            }
            IngestStatus::Skipped { reason } => {
                warn!(instrument = %line.instrument, %reason, "skipped")
            }
            IngestStatus::Failed { error } => {
                error!(instrument = %line.instrument, %error, "failed")
            }
        }
    }

    if report.failed() > 0 {
        bail!(
            "{} of {} instruments failed to store",
            report.failed(),
            report.instruments.len()
        );
    }
    Ok(())
}
