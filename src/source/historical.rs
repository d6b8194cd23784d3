// =============================================================================
// Historical Trade Source — paginated backfill over a bounded range
// =============================================================================
//
// Each instrument owns a `BackfillCursor` over `[from_ms, to_ms]`. A poll
// fetches exactly one page for one instrument, round-robin over instruments
// that are not done yet, so memory stays bounded and no instrument starves.
//
//   - rows stamped after `to_ms` are dropped client-side (upstream spill-over)
//   - the cursor advances to the newest row upstream returned, valid or not,
//     and never moves backwards
//   - the next request resumes from the venue's paging cursor when the page
//     carries one, so rows sharing the boundary millisecond are not refetched
//   - a page with no upstream rows at all, a page with spill-over, or a
//     cursor at/after `to_ms` finishes the instrument; a page whose rows were
//     all rejected does not
//   - a rate-limited response sleeps a fixed backoff and retries the same
//     instrument with the cursor unchanged; too many in a row give up on it
// =============================================================================

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::kraken::{RateLimitTracker, RateLimitVerdict};
use crate::source::{SourcedTrade, TradeSource};
use crate::types::{SourceCursor, SourceMode, Trade};

pub const NS_PER_MS: i64 = 1_000_000;

/// Trades from one page, plus what upstream said about the page itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradePage {
    /// Rows that parsed and passed trade validation, in upstream order.
    pub trades: Vec<Trade>,
    /// Rows upstream returned, valid or not. Zero means history is exhausted.
    pub raw_rows: usize,
    /// Timestamp of the last upstream row, when it was readable.
    pub last_raw_ms: Option<i64>,
    /// Paging cursor for the next request, when upstream sends one.
    pub next_since_ns: Option<i64>,
}

/// One page of history as the venue answered it.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryPage {
    Trades(TradePage),
    RateLimited,
}

/// Paged trade-history endpoint keyed by `(instrument, since)`, with `since`
/// in nanoseconds since the epoch.
#[async_trait]
pub trait TradeHistoryApi: Send + Sync {
    async fn fetch_page(&self, instrument_id: &str, since_ns: i64) -> Result<HistoryPage>;
}

// =============================================================================
// BackfillCursor
// =============================================================================

/// Backfill progress for one instrument. `done` is permanent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillCursor {
    pub from_ms: i64,
    pub to_ms: i64,
    pub last_fetched_ms: i64,
    pub done: bool,
}

impl BackfillCursor {
    /// An empty or inverted range is done from the start.
    pub fn new(from_ms: i64, to_ms: i64) -> Self {
        Self {
            from_ms,
            to_ms,
            last_fetched_ms: from_ms,
            done: to_ms <= from_ms,
        }
    }

    /// Move forward to `timestamp_ms`; earlier values are ignored.
    pub fn advance(&mut self, timestamp_ms: i64) {
        if self.done {
            return;
        }
        if timestamp_ms > self.last_fetched_ms {
            self.last_fetched_ms = timestamp_ms;
        }
        if self.last_fetched_ms >= self.to_ms {
            self.done = true;
        }
    }

    pub fn finish(&mut self) {
        self.done = true;
    }
}

// =============================================================================
// HistoricalTradeSource
// =============================================================================

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    pub page_delay: Duration,
    pub rate_limit_backoff: Duration,
    pub max_rate_limit_retries: u32,
}

#[derive(Debug)]
struct Lane {
    instrument_id: String,
    cursor: BackfillCursor,
    /// `since` for the next request.
    since_ns: i64,
}

pub struct HistoricalTradeSource {
    api: Box<dyn TradeHistoryApi>,
    lanes: Vec<Lane>,
    next_lane: usize,
    page_delay: Duration,
    rate_limits: RateLimitTracker,
    checkpoint: Option<CheckpointStore>,
    pages_fetched: u64,
}

impl HistoricalTradeSource {
    pub fn new(
        api: Box<dyn TradeHistoryApi>,
        instruments: &[String],
        from_ms: i64,
        to_ms: i64,
        settings: BackfillSettings,
        checkpoint: Option<CheckpointStore>,
    ) -> Self {
        let lanes = instruments
            .iter()
            .map(|id| {
                let mut cursor = BackfillCursor::new(from_ms, to_ms);
                if let Some(committed) = checkpoint.as_ref().and_then(|cp| cp.committed_ms(id)) {
                    info!(instrument = %id, committed_ms = committed, "resuming backfill from checkpoint");
                    cursor.advance(committed);
                }
                if cursor.done {
                    info!(instrument = %id, from_ms, to_ms, "instrument backfill already complete");
                }
                Lane {
                    instrument_id: id.clone(),
                    since_ns: cursor.last_fetched_ms.saturating_mul(NS_PER_MS),
                    cursor,
                }
            })
            .collect();

        Self {
            api,
            lanes,
            next_lane: 0,
            page_delay: settings.page_delay,
            rate_limits: RateLimitTracker::new(
                settings.rate_limit_backoff,
                settings.max_rate_limit_retries,
            ),
            checkpoint,
            pages_fetched: 0,
        }
    }

    #[cfg(test)]
    pub fn cursor(&self, instrument_id: &str) -> Option<&BackfillCursor> {
        self.lanes
            .iter()
            .find(|l| l.instrument_id == instrument_id)
            .map(|l| &l.cursor)
    }

    /// First lane at or after `next_lane` (wrapping) that is not done.
    fn pending_lane(&self) -> Option<usize> {
        let n = self.lanes.len();
        (0..n)
            .map(|offset| (self.next_lane + offset) % n)
            .find(|&idx| !self.lanes[idx].cursor.done)
    }

    /// Fold a fetched page into lane `idx`, returning the trades to emit.
    fn absorb_page(&mut self, idx: usize, page: TradePage) -> Vec<SourcedTrade> {
        let pages_fetched = self.pages_fetched;
        let lane = &mut self.lanes[idx];
        let to_ms = lane.cursor.to_ms;

        if page.raw_rows == 0 {
            info!(instrument = %lane.instrument_id, pages_fetched, "no more trades upstream; backfill done");
            lane.cursor.finish();
            return Vec::new();
        }

        let valid = page.trades.len();
        let kept: Vec<Trade> = page
            .trades
            .into_iter()
            .filter(|t| t.timestamp_ms() <= to_ms)
            .collect();
        // Rows arrive in time order, so spill-over means the range is covered.
        let spilled = kept.len() < valid || page.last_raw_ms.is_some_and(|ts| ts > to_ms);

        let newest = kept
            .last()
            .map(Trade::timestamp_ms)
            .into_iter()
            .chain(page.last_raw_ms)
            .max();
        if let Some(ts) = newest {
            lane.cursor.advance(ts.min(to_ms));
        }

        let previous_ns = lane.since_ns;
        let next_ns = page
            .next_since_ns
            .unwrap_or_else(|| lane.cursor.last_fetched_ms.saturating_mul(NS_PER_MS));
        if next_ns > previous_ns {
            lane.since_ns = next_ns;
        } else {
            // A full page inside one timestamp would otherwise repeat forever.
            warn!(
                instrument = %lane.instrument_id,
                last_fetched_ms = lane.cursor.last_fetched_ms,
                "page did not advance the cursor; stepping forward 1 ms"
            );
            lane.since_ns = previous_ns.saturating_add(NS_PER_MS);
            lane.cursor.advance(lane.since_ns / NS_PER_MS);
        }
        if spilled {
            lane.cursor.advance(to_ms);
        }

        debug!(
            instrument = %lane.instrument_id,
            raw_rows = page.raw_rows,
            valid,
            kept = kept.len(),
            last_fetched_ms = lane.cursor.last_fetched_ms,
            since_ns = lane.since_ns,
            "backfill page"
        );
        if lane.cursor.done {
            info!(instrument = %lane.instrument_id, to_ms, pages_fetched, "instrument backfill done");
        }

        let instrument_id = lane.instrument_id.clone();
        kept.into_iter()
            .map(|trade| SourcedTrade {
                cursor: SourceCursor::Backfill {
                    instrument_id: instrument_id.clone(),
                    timestamp_ms: trade.timestamp_ms(),
                },
                trade,
            })
            .collect()
    }
}

#[async_trait]
impl TradeSource for HistoricalTradeSource {
    async fn poll(&mut self) -> Result<Vec<SourcedTrade>> {
        let Some(idx) = self.pending_lane() else {
            return Ok(Vec::new());
        };
        let instrument_id = self.lanes[idx].instrument_id.clone();
        let since_ns = self.lanes[idx].since_ns;

        // On error the cursor and lane pointer stay put so the same page is
        // requested again.
        let page = self.api.fetch_page(&instrument_id, since_ns).await?;

        match page {
            HistoryPage::RateLimited => {
                match self.rate_limits.record_limited(&instrument_id) {
                    RateLimitVerdict::Backoff(delay) => tokio::time::sleep(delay).await,
                    RateLimitVerdict::GiveUp => {
                        self.lanes[idx].cursor.finish();
                        self.next_lane = idx + 1;
                    }
                }
                Ok(Vec::new())
            }
            HistoryPage::Trades(page) => {
                self.rate_limits.record_success(&instrument_id);
                self.pages_fetched += 1;
                let out = self.absorb_page(idx, page);
                self.next_lane = idx + 1;
                if !self.page_delay.is_zero() && !self.is_exhausted() {
                    tokio::time::sleep(self.page_delay).await;
                }
                Ok(out)
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.lanes.iter().all(|l| l.cursor.done)
    }

    async fn commit(&mut self, cursors: &[SourceCursor]) -> Result<()> {
        let Some(checkpoint) = self.checkpoint.as_mut() else {
            return Ok(());
        };
        for cursor in cursors {
            if let SourceCursor::Backfill {
                instrument_id,
                timestamp_ms,
            } = cursor
            {
                checkpoint.record(instrument_id, *timestamp_ms);
            }
        }
        checkpoint.save()?;
        debug!(
            count = cursors.len(),
            path = %checkpoint.path().display(),
            "backfill cursors committed"
        );
        Ok(())
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Historical
    }
}

// =============================================================================
// Tests
// =============================================================================
