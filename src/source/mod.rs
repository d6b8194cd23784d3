// =============================================================================
// Trade Sources — one capability interface, two lifecycles
// =============================================================================
//
// Live and log sources never finish; historical sources finish once every
// instrument's backfill cursor is done. Which one runs is decided once, from
// configuration, by `build_source`.
// =============================================================================

pub mod historical;
pub mod live;
pub mod log;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::config::{PipelineConfig, SourceKind};
use crate::kraken::KrakenRestClient;
use crate::types::{SourceCursor, SourceMode, Trade};

pub use historical::{BackfillSettings, HistoricalTradeSource};
pub use live::LiveTradeSource;
pub use log::LogTradeSource;

/// A trade plus the cursor needed to acknowledge it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcedTrade {
    pub trade: Trade,
    pub cursor: SourceCursor,
}

#[async_trait]
pub trait TradeSource: Send {
    /// Fetch the next batch of trades. May be empty (timeout, heartbeat,
    /// backoff). Transient venue errors are absorbed here where possible.
    async fn poll(&mut self) -> Result<Vec<SourcedTrade>>;

    /// `true` once the source will never yield another trade.
    fn is_exhausted(&self) -> bool;

    /// Acknowledge cursors whose records are durably written downstream.
    async fn commit(&mut self, cursors: &[SourceCursor]) -> Result<()>;

    fn mode(&self) -> SourceMode;
}

/// Construct the source selected by `config.source` and `config.mode`.
pub fn build_source(config: &PipelineConfig) -> Result<Box<dyn TradeSource>> {
    if config.source == SourceKind::Log {
        return Ok(Box::new(LogTradeSource::new(&config.kafka, config.mode)?));
    }
    match config.mode {
        SourceMode::Live => {
            info!(url = %config.live.ws_url, instruments = ?config.instruments, "using live trade source");
            Ok(Box::new(LiveTradeSource::new(
                config.instruments.clone(),
                &config.live,
            )))
        }
        SourceMode::Historical => {
            let backfill = &config.backfill;
            let (from_ms, to_ms) = backfill.resolve_range(Utc::now());
            info!(from_ms, to_ms, instruments = ?config.instruments, "using historical trade source");

            let api = KrakenRestClient::new(&backfill.rest_url)?;
            let checkpoint = backfill
                .checkpoint_path
                .as_ref()
                .map(|path| CheckpointStore::open(path))
                .transpose()?;
            let settings = BackfillSettings {
                page_delay: Duration::from_millis(backfill.page_delay_ms),
                rate_limit_backoff: Duration::from_millis(backfill.rate_limit_backoff_ms),
                max_rate_limit_retries: backfill.max_rate_limit_retries,
            };

            Ok(Box::new(HistoricalTradeSource::new(
                Box::new(api),
                &config.instruments,
                from_ms,
                to_ms,
                settings,
                checkpoint,
            )))
        }
    }
}
