// =============================================================================
// OHLC Aggregator — tumbling-window candles driven by event time
// =============================================================================
//
// Window assignment: start = floor(timestamp / duration) * duration.
//
// A window closes when a later trade for the same instrument arrives (the
// watermark); there is no wall-clock timer, so replayed history windows
// exactly like live data. Per (instrument, window) the lifecycle is
// Open -> Closed(emitted); a closed window never reopens, and a trade aimed at
// one is dropped.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{debug, warn};

use crate::types::{Candle, SourceCursor, Trade};

/// Identifies one candle: an instrument and the start of its window.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowKey {
    pub instrument_id: String,
    pub window_start_ms: i64,
}

/// In-progress candle for one open window.
#[derive(Debug, Clone)]
pub struct CandleAccumulator {
    candle: Candle,
    /// Cursors of every trade folded in, in arrival order.
    cursors: Vec<SourceCursor>,
}

impl CandleAccumulator {
    fn open(key: &WindowKey, window_duration_ms: i64, trade: &Trade) -> Self {
        let price = trade.price();
        Self {
            candle: Candle {
                instrument_id: key.instrument_id.clone(),
                window_start_ms: key.window_start_ms,
                window_end_ms: key.window_start_ms.saturating_add(window_duration_ms),
                open: price,
                high: price,
                low: price,
                close: price,
                volume: trade.volume(),
                trade_count: 1,
            },
            cursors: Vec::new(),
        }
    }

    fn apply(&mut self, trade: &Trade) {
        let price = trade.price();
        let c = &mut self.candle;
        c.high = c.high.max(price);
        c.low = c.low.min(price);
        c.close = price;
        c.volume += trade.volume();
        c.trade_count += 1;
    }

    /// Consumes the accumulator; a closed window has no accumulator left.
    fn close(self) -> ClosedCandle {
        ClosedCandle {
            candle: self.candle,
            cursors: self.cursors,
        }
    }

    #[cfg(test)]
    pub fn candle(&self) -> &Candle {
        &self.candle
    }
}

/// A finalized candle plus the cursors of every trade it contains.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedCandle {
    pub candle: Candle,
    pub cursors: Vec<SourceCursor>,
}

/// What folding one trade did.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    /// Applied to its window; no window closed.
    Folded,
    /// Applied to a new window, closing the instrument's previous one.
    FoldedAndClosed(ClosedCandle),
    /// Aimed at an already-closed window and dropped.
    Late,
}

impl FoldOutcome {
    pub fn is_late(&self) -> bool {
        matches!(self, Self::Late)
    }

    pub fn closed(self) -> Option<ClosedCandle> {
        match self {
            Self::FoldedAndClosed(closed) => Some(closed),
            Self::Folded | Self::Late => None,
        }
    }
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub trades_applied: u64,
    pub candles_emitted: u64,
    pub late_trades_dropped: u64,
}

pub struct OhlcAggregator {
    window_duration_ms: i64,
    accumulators: BTreeMap<WindowKey, CandleAccumulator>,
    /// Start of the newest window seen per instrument.
    open_window: HashMap<String, i64>,
    stats: AggregatorStats,
}

impl OhlcAggregator {
    pub fn new(window_duration_ms: u64) -> Self {
        Self {
            window_duration_ms: i64::try_from(window_duration_ms.max(1)).unwrap_or(i64::MAX),
            accumulators: BTreeMap::new(),
            open_window: HashMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn window_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms.div_euclid(self.window_duration_ms) * self.window_duration_ms
    }

    /// Fold one trade in. A trade for a newer window closes the instrument's
    /// previous window and hands its candle back.
    pub fn on_trade(&mut self, trade: &Trade, cursor: Option<SourceCursor>) -> FoldOutcome {
        let instrument = trade.instrument_id();
        let window_start_ms = self.window_start(trade.timestamp_ms());
        let key = WindowKey {
            instrument_id: instrument.to_string(),
            window_start_ms,
        };

        let mut emitted = None;
        match self.open_window.get(instrument).copied() {
            Some(current) if window_start_ms < current => {
                self.stats.late_trades_dropped += 1;
                warn!(
                    instrument = %instrument,
                    window_start_ms,
                    open_window_ms = current,
                    timestamp_ms = trade.timestamp_ms(),
                    "late trade for a closed window dropped"
                );
                return FoldOutcome::Late;
            }
            Some(current) if window_start_ms > current => {
                let prev = WindowKey {
                    instrument_id: instrument.to_string(),
                    window_start_ms: current,
                };
                if let Some(acc) = self.accumulators.remove(&prev) {
                    emitted = Some(self.emit(acc));
                }
                self.open_window.insert(instrument.to_string(), window_start_ms);
            }
            Some(_) => {}
            None => {
                self.open_window.insert(instrument.to_string(), window_start_ms);
            }
        }

        let window_duration_ms = self.window_duration_ms;
        let acc = self
            .accumulators
            .entry(key)
            .and_modify(|acc| acc.apply(trade))
            .or_insert_with_key(|k| CandleAccumulator::open(k, window_duration_ms, trade));
        acc.cursors.extend(cursor);
        self.stats.trades_applied += 1;

        match emitted {
            Some(closed) => FoldOutcome::FoldedAndClosed(closed),
            None => FoldOutcome::Folded,
        }
    }

    /// Close every open window (end of stream), ordered by instrument then
    /// window start.
    pub fn drain(&mut self) -> Vec<ClosedCandle> {
        // Watermarks stay: a closed window must stay closed.
        let accumulators = std::mem::take(&mut self.accumulators);
        accumulators
            .into_values()
            .map(|acc| self.emit(acc))
            .collect()
    }

    pub fn open_windows(&self) -> usize {
        self.accumulators.len()
    }

    #[cfg(test)]
    pub fn peek(&self, key: &WindowKey) -> Option<&CandleAccumulator> {
        self.accumulators.get(key)
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    fn emit(&mut self, acc: CandleAccumulator) -> ClosedCandle {
        let closed = acc.close();
        self.stats.candles_emitted += 1;
        debug!(
            instrument = %closed.candle.instrument_id,
            window_start_ms = closed.candle.window_start_ms,
            open = closed.candle.open,
            high = closed.candle.high,
            low = closed.candle.low,
            close = closed.candle.close,
            "candle closed"
        );
        closed
    }
}

// =============================================================================
// Tests
// =============================================================================
