// =============================================================================
// OHLC Pipeline — Main Entry Point
// =============================================================================
//
// Streams (or backfills) trades, folds them into tumbling-window candles and
// delivers trades and candles to a feature store with at-least-once
// semantics. One pipeline per process; Ctrl+C stops it between iterations.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod checkpoint;
mod config;
mod driver;
mod kraken;
mod ledger;
mod sink;
mod source;
mod types;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;
use crate::driver::{PipelineDriver, RunOutcome};

const DEFAULT_CONFIG_PATH: &str = "pipeline_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        OHLC Pipeline — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("PIPELINE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = PipelineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "Failed to load config, using defaults");
        PipelineConfig::default()
    });
    config.apply_env_overrides()?;
    config.validate()?;

    info!(
        source = ?config.source,
        mode = %config.mode,
        instruments = ?config.instruments,
        window_ms = config.window_duration_ms,
        max_batch_size = config.max_batch_size,
        max_flush_interval_ms = config.max_flush_interval_ms,
        destination = %config.destination(),
        "Pipeline configured"
    );
    if config.source == config::SourceKind::Log {
        info!(
            broker = %config.kafka.broker_address,
            topic = %config.kafka.trades_topic,
            group = %config.kafka.consumer_group,
            "Trades replayed from log"
        );
    }

    // ── 2. Build source, store and driver ────────────────────────────────
    let source = source::build_source(&config)?;
    let store = sink::build_feature_store(&config)?;
    info!(backend = store.backend_type(), "Feature store ready");
    let mut driver = PipelineDriver::new(&config, source, store);

    // ── 3. Stop signal ───────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown signal received, stopping after the current iteration");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    // ── 4. Run ───────────────────────────────────────────────────────────
    let outcome = driver.run(shutdown_rx).await?;
    let stats = driver.stats();
    match outcome {
        RunOutcome::Exhausted => info!(?stats, "Backfill complete"),
        RunOutcome::Cancelled => info!(?stats, "Pipeline cancelled"),
    }
    if stats.flush_failures > 0 {
        warn!(
            flush_failures = stats.flush_failures,
            max_consecutive = stats.max_consecutive_flush_failures,
            "Feature store rejected writes during the run"
        );
    }
    if stats.late_trades_dropped > 0 {
        warn!(late_trades = stats.late_trades_dropped, "Trades arrived after their window closed");
    }

    info!("OHLC Pipeline shut down complete.");
    Ok(())
}
