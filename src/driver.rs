// =============================================================================
// Pipeline Driver — the single cooperative poll loop
// =============================================================================
//
// Each iteration:  stop? -> exhausted? -> poll -> route -> maybe_flush -> commit
//
// Routing:
//   - trades feed the aggregator when candles are enabled; an emitted candle
//     carries the cursors of every trade folded into it
//   - raw trades are buffered, with their own cursor, when persisted
//   - trades and candles buffer separately, one sink per feature group; a
//     full sink is flushed before anything more is added to it
//
// Every trade's cursor is held in the commit ledger until each record it fed
// has been written, and only the ledger's frontier is committed. The stop
// signal is observed between iterations only, so an in-flight poll or flush
// always completes.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aggregator::OhlcAggregator;
use crate::config::PipelineConfig;
use crate::ledger::CommitLedger;
use crate::sink::{BufferEntry, BufferedSink, FeatureStore, FlushResult};
use crate::source::{SourcedTrade, TradeSource};
use crate::types::{Record, RecordKind, WriteMode};

/// Flush order within one tick.
const SINK_ORDER: [RecordKind; 2] = [RecordKind::Trade, RecordKind::Candle];

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Historical source finished and every record was written.
    Exhausted,
    /// Stop signal observed.
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub trades_seen: u64,
    pub candles_emitted: u64,
    pub late_trades_dropped: u64,
    pub flushes: u64,
    pub entries_flushed: u64,
    pub flush_failures: u64,
    /// Longest run of back-to-back failed flushes on one sink.
    pub max_consecutive_flush_failures: u32,
    pub cursors_committed: u64,
    pub commit_errors: u64,
    pub poll_errors: u64,
}

pub struct PipelineDriver {
    source: Box<dyn TradeSource>,
    aggregator: Option<OhlcAggregator>,
    trade_sink: Option<BufferedSink>,
    candle_sink: Option<BufferedSink>,
    ledger: CommitLedger,
    destination: WriteMode,
    poll_error_backoff: Duration,
    flush_retry_delay: Duration,
    stats: DriverStats,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleep for `delay`, waking early if the stop signal changes.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        changed = shutdown.changed() => {
            // Sender gone: nobody can cancel any more, so sleep normally.
            if changed.is_err() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

impl PipelineDriver {
    pub fn new(
        config: &PipelineConfig,
        source: Box<dyn TradeSource>,
        store: Arc<dyn FeatureStore>,
    ) -> Self {
        let started = now_ms();
        let sink_for = |group| {
            BufferedSink::new(
                store.clone(),
                group,
                config.max_batch_size,
                config.max_flush_interval_ms,
                started,
            )
        };
        let aggregate = config.routing.aggregate_candles;
        Self {
            source,
            aggregator: aggregate.then(|| OhlcAggregator::new(config.window_duration_ms)),
            trade_sink: config
                .routing
                .persist_trades
                .then(|| sink_for(config.feature_store.trade_group.clone())),
            candle_sink: aggregate.then(|| sink_for(config.feature_store.candle_group.clone())),
            ledger: CommitLedger::new(),
            destination: config.destination(),
            poll_error_backoff: Duration::from_millis(config.poll_error_backoff_ms),
            flush_retry_delay: Duration::from_millis(config.flush_retry_delay_ms),
            stats: DriverStats::default(),
        }
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    /// Entries waiting in any sink.
    pub fn buffered(&self) -> usize {
        self.trade_sink
            .iter()
            .chain(self.candle_sink.iter())
            .map(BufferedSink::len)
            .sum()
    }

    fn sink_mut(&mut self, kind: RecordKind) -> Option<&mut BufferedSink> {
        match kind {
            RecordKind::Trade => self.trade_sink.as_mut(),
            RecordKind::Candle => self.candle_sink.as_mut(),
        }
    }

    /// Run until the source is exhausted or `shutdown` turns `true`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<RunOutcome> {
        info!(
            mode = %self.source.mode(),
            destination = %self.destination,
            candles = ?self.candle_sink.as_ref().map(|s| s.group().to_string()),
            trades = ?self.trade_sink.as_ref().map(|s| s.group().to_string()),
            "pipeline started"
        );

        loop {
            if is_cancelled(&shutdown) {
                return Ok(self.stop().await);
            }
            if self.source.is_exhausted() {
                return Ok(self.finish(&mut shutdown).await);
            }

            match self.source.poll().await {
                Ok(batch) => {
                    for sourced in batch {
                        // Cancelled while blocked on a full sink; the rest of
                        // the batch was never held and will be redelivered.
                        if !self.route(sourced, &mut shutdown).await {
                            break;
                        }
                    }
                }
                Err(e) => {
                    self.stats.poll_errors += 1;
                    warn!(
                        error = %format!("{e:#}"),
                        backoff_ms = self.poll_error_backoff.as_millis() as u64,
                        "trade source poll failed"
                    );
                    pause(self.poll_error_backoff, &mut shutdown).await;
                }
            }

            self.tick(false).await;
        }
    }

    /// Fan one trade out to the aggregator and the sinks. Returns `false` if
    /// a stop arrived while waiting for room.
    async fn route(&mut self, sourced: SourcedTrade, shutdown: &mut watch::Receiver<bool>) -> bool {
        let SourcedTrade { trade, cursor } = sourced;
        self.stats.trades_seen += 1;

        let mut holds = 0;
        let mut closed = None;
        if let Some(agg) = self.aggregator.as_mut() {
            let outcome = agg.on_trade(&trade, Some(cursor.clone()));
            if outcome.is_late() {
                self.stats.late_trades_dropped += 1;
            } else {
                holds += 1;
            }
            closed = outcome.closed();
        }
        let persist = self.trade_sink.is_some();
        if persist {
            holds += 1;
        }
        self.ledger.hold(&cursor, holds);

        if let Some(closed) = closed {
            self.stats.candles_emitted += 1;
            let entry = BufferEntry::new(Record::Candle(closed.candle), self.destination, closed.cursors);
            if !self.push(RecordKind::Candle, entry, shutdown).await {
                return false;
            }
        }
        if persist {
            let entry = BufferEntry::new(Record::Trade(trade), self.destination, vec![cursor]);
            return self.push(RecordKind::Trade, entry, shutdown).await;
        }
        true
    }

    /// Ingest into the sink for `kind`, first flushing it for as long as it
    /// is full. Nothing more is ingested meanwhile, which is the backpressure
    /// on the source.
    async fn push(
        &mut self,
        kind: RecordKind,
        entry: BufferEntry,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        while self.sink_mut(kind).is_some_and(|sink| sink.is_full()) {
            let result = self.flush_sink(kind, false).await;
            let skipped = matches!(result, FlushResult::Skipped);
            let failed = result.is_failed();
            self.settle(result).await;
            if skipped {
                break;
            }
            if failed {
                if is_cancelled(shutdown) {
                    return false;
                }
                pause(self.flush_retry_delay, shutdown).await;
            }
        }
        if let Some(sink) = self.sink_mut(kind) {
            sink.ingest(entry);
        }
        true
    }

    async fn flush_sink(&mut self, kind: RecordKind, force: bool) -> FlushResult {
        match self.sink_mut(kind) {
            Some(sink) => sink.maybe_flush(now_ms(), force).await,
            None => FlushResult::Skipped,
        }
    }

    /// Give every sink one flush opportunity. Returns `true` if any failed.
    async fn tick(&mut self, force: bool) -> bool {
        let mut failed = false;
        for kind in SINK_ORDER {
            let result = self.flush_sink(kind, force).await;
            failed |= result.is_failed();
            self.settle(result).await;
        }
        failed
    }

    /// Account for a flush and commit whatever it made safe.
    async fn settle(&mut self, result: FlushResult) {
        match result {
            FlushResult::Skipped => {}
            FlushResult::Flushed { entries, cursors } => {
                self.stats.flushes += 1;
                self.stats.entries_flushed += entries as u64;
                for cursor in &cursors {
                    self.ledger.release(cursor);
                }
                self.commit_ready().await;
            }
            FlushResult::Failed {
                consecutive_failures,
            } => {
                self.stats.flush_failures += 1;
                self.stats.max_consecutive_flush_failures = self
                    .stats
                    .max_consecutive_flush_failures
                    .max(consecutive_failures);
            }
        }
    }

    async fn commit_ready(&mut self) {
        let ready = self.ledger.take_committable();
        if ready.is_empty() {
            return;
        }
        match self.source.commit(&ready).await {
            Ok(()) => {
                self.stats.cursors_committed += ready.len() as u64;
                debug!(cursors = ?ready, "cursors committed");
            }
            Err(e) => {
                // Data is written; the source will redeliver.
                self.stats.commit_errors += 1;
                warn!(error = %format!("{e:#}"), "cursor commit failed");
            }
        }
    }

    /// End of a finite stream: close every window, then flush until written.
    async fn finish(&mut self, shutdown: &mut watch::Receiver<bool>) -> RunOutcome {
        let closed = self
            .aggregator
            .as_mut()
            .map(OhlcAggregator::drain)
            .unwrap_or_default();
        info!(candles = closed.len(), "source exhausted; closing open windows");
        for c in closed {
            self.stats.candles_emitted += 1;
            let entry = BufferEntry::new(Record::Candle(c.candle), self.destination, c.cursors);
            if !self.push(RecordKind::Candle, entry, shutdown).await {
                return self.abandon_drain();
            }
        }

        while self.tick(true).await {
            if is_cancelled(shutdown) {
                return self.abandon_drain();
            }
            pause(self.flush_retry_delay, shutdown).await;
        }

        self.sync_aggregator_stats();
        info!(stats = ?self.stats, "pipeline drained");
        RunOutcome::Exhausted
    }

    fn abandon_drain(&mut self) -> RunOutcome {
        self.sync_aggregator_stats();
        warn!(
            buffered = self.buffered(),
            uncommitted = self.ledger.outstanding(),
            "stop requested during final drain; uncommitted records will be redelivered"
        );
        RunOutcome::Cancelled
    }

    /// Stop signal: one forced flush attempt per sink, commit only what
    /// succeeded. Open windows are left alone; their trades are redelivered
    /// on restart.
    async fn stop(&mut self) -> RunOutcome {
        if self.tick(true).await {
            warn!(buffered = self.buffered(), "final flush failed; cursors not committed");
        }
        self.sync_aggregator_stats();
        info!(
            open_windows = self.aggregator.as_ref().map_or(0, |a| a.open_windows()),
            uncommitted = self.ledger.outstanding(),
            stats = ?self.stats,
            "pipeline stopped"
        );
        RunOutcome::Cancelled
    }

    fn sync_aggregator_stats(&mut self) {
        if let Some(agg) = &self.aggregator {
            let agg_stats = agg.stats();
            debug!(
                trades_applied = agg_stats.trades_applied,
                candles_emitted = agg_stats.candles_emitted,
                late_trades_dropped = agg_stats.late_trades_dropped,
                "aggregator totals"
            );
            self.stats.late_trades_dropped = agg_stats.late_trades_dropped;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::bail;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::sink::tests::RecordingStore;
    use crate::types::{SourceCursor, SourceMode, Trade};

    enum Step {
        Trades(Vec<SourcedTrade>),
        Fail,
    }

    /// Plays back a fixed script. Finite sources become exhausted at the end;
    /// infinite ones raise the stop signal instead.
    struct ScriptedSource {
        script: VecDeque<Step>,
        finite: bool,
        stop: Option<watch::Sender<bool>>,
        committed: Arc<Mutex<Vec<SourceCursor>>>,
    }

    #[async_trait]
    impl TradeSource for ScriptedSource {
        async fn poll(&mut self) -> Result<Vec<SourcedTrade>> {
            let step = self.script.pop_front();
            if self.script.is_empty() {
                if let Some(stop) = &self.stop {
                    let _ = stop.send(true);
                }
            }
            match step {
                Some(Step::Trades(t)) => Ok(t),
                Some(Step::Fail) => bail!("venue unreachable"),
                None => Ok(Vec::new()),
            }
        }

        fn is_exhausted(&self) -> bool {
            self.finite && self.script.is_empty()
        }

        async fn commit(&mut self, cursors: &[SourceCursor]) -> Result<()> {
            self.committed.lock().extend_from_slice(cursors);
            Ok(())
        }

        fn mode(&self) -> SourceMode {
            if self.finite {
                SourceMode::Historical
            } else {
                SourceMode::Live
            }
        }
    }

    fn sourced(ts: i64, price: f64) -> SourcedTrade {
        SourcedTrade {
            trade: Trade::new("BTC/USD", price, 1.0, ts).unwrap(),
            cursor: cursor(ts),
        }
    }

    fn cursor(ts: i64) -> SourceCursor {
        SourceCursor::Backfill {
            instrument_id: "BTC/USD".into(),
            timestamp_ms: ts,
        }
    }

    fn logged(instrument: &str, ts: i64, offset: i64) -> SourcedTrade {
        SourcedTrade {
            trade: Trade::new(instrument, 1.0, 1.0, ts).unwrap(),
            cursor: SourceCursor::Log {
                topic: "trades".into(),
                partition: 0,
                offset,
            },
        }
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.mode = SourceMode::Historical;
        config.window_duration_ms = 60_000;
        config.max_batch_size = 100;
        config.max_flush_interval_ms = 3_600_000;
        config.poll_error_backoff_ms = 1;
        config.flush_retry_delay_ms = 1;
        config
    }

    struct Harness {
        driver: PipelineDriver,
        store: RecordingStore,
        committed: Arc<Mutex<Vec<SourceCursor>>>,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    fn harness(config: &PipelineConfig, script: Vec<Step>, finite: bool) -> Harness {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let committed = Arc::new(Mutex::new(Vec::new()));
        let source = ScriptedSource {
            script: script.into(),
            finite,
            stop: (!finite).then(|| shutdown_tx.clone()),
            committed: committed.clone(),
        };
        let store = RecordingStore::default();
        let driver = PipelineDriver::new(config, Box::new(source), Arc::new(store.clone()));
        Harness {
            driver,
            store,
            committed,
            shutdown_tx,
            shutdown_rx,
        }
    }

    fn rows_in(store: &RecordingStore, group: &str) -> usize {
        store
            .calls()
            .iter()
            .filter(|c| c.group.name == group)
            .map(|c| c.rows.len())
            .sum()
    }

    #[tokio::test]
    async fn exhaustion_emits_open_windows_and_commits_the_frontier() {
        let script = vec![
            Step::Trades(vec![sourced(1_000, 100.0), sourced(2_000, 110.0)]),
            Step::Trades(vec![sourced(61_000, 105.0)]),
        ];
        let mut h = harness(&config(), script, true);

        let outcome = h.driver.run(h.shutdown_rx.clone()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Exhausted);

        let calls = h.store.calls();
        let candles: Vec<_> = calls
            .iter()
            .filter(|c| c.group.name == "ohlc_feature_group")
            .flat_map(|c| c.rows.clone())
            .collect();
        assert_eq!(rows_in(&h.store, "trades"), 3);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0]["open"], 100.0);
        assert_eq!(candles[0]["close"], 110.0);
        assert_eq!(candles[1]["window_start_ms"], 60_000);
        assert!(calls.iter().all(|c| c.mode == WriteMode::Offline));
        // One store call per sink.
        assert_eq!(calls.len(), 2);

        // Nothing is committable until both the trades and their candles are written.
        assert_eq!(*h.committed.lock(), vec![cursor(61_000)]);
        assert_eq!(h.driver.stats().candles_emitted, 2);
        assert_eq!(h.driver.stats().entries_flushed, 5);
        assert_eq!(h.driver.buffered(), 0);
        drop(h.shutdown_tx);
    }

    #[tokio::test]
    async fn without_candles_trades_carry_their_own_cursors() {
        let mut config = config();
        config.routing.aggregate_candles = false;
        let script = vec![Step::Trades(vec![sourced(1_000, 1.0), sourced(2_000, 2.0)])];
        let mut h = harness(&config, script, true);

        h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        assert_eq!(*h.committed.lock(), vec![cursor(2_000)]);
        assert!(h.store.calls().iter().all(|c| c.group.name == "trades"));
    }

    #[tokio::test]
    async fn full_buffer_flushes_before_more_is_ingested() {
        let mut config = config();
        config.routing.aggregate_candles = false;
        config.max_batch_size = 2;
        let batch = (1..=5).map(|i| sourced(i * 1_000, 1.0)).collect();
        let mut h = harness(&config, vec![Step::Trades(batch)], true);

        h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        let sizes: Vec<usize> = h.store.calls().iter().map(|c| c.rows.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(
            *h.committed.lock(),
            vec![cursor(2_000), cursor(4_000), cursor(5_000)]
        );
    }

    #[tokio::test]
    async fn candles_and_trades_each_respect_batch_bound() {
        let mut config = config();
        config.max_batch_size = 2;
        let batch = vec![sourced(1_000, 1.0), sourced(2_000, 2.0), sourced(61_000, 3.0)];
        let mut h = harness(&config, vec![Step::Trades(batch)], true);

        h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        let calls = h.store.calls();
        assert!(calls.iter().all(|c| c.rows.len() <= 2));
        let writes: Vec<(&str, usize)> = calls
            .iter()
            .map(|c| (c.group.name.as_str(), c.rows.len()))
            .collect();
        assert_eq!(
            writes,
            vec![("trades", 2), ("trades", 1), ("ohlc_feature_group", 2)]
        );
        // The early trade flush alone releases nothing: the candle was still buffered.
        assert_eq!(*h.committed.lock(), vec![cursor(61_000)]);
    }

    #[tokio::test]
    async fn window_close_with_three_slot_buffer_never_overruns() {
        let mut config = config();
        config.max_batch_size = 3;
        let batch = vec![sourced(1_000, 1.0), sourced(2_000, 2.0), sourced(61_000, 3.0)];
        let mut h = harness(&config, vec![Step::Trades(batch)], true);

        h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        let sizes: Vec<usize> = h.store.calls().iter().map(|c| c.rows.len()).collect();
        assert!(sizes.iter().all(|&n| n <= 3), "write sizes {sizes:?}");
        assert_eq!(sizes.iter().sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn final_drain_retries_until_written() {
        let mut config = config();
        config.routing.aggregate_candles = false;
        let mut h = harness(&config, vec![Step::Trades(vec![sourced(1_000, 1.0)])], true);
        h.store.fail_next(2);

        let outcome = h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Exhausted);
        assert_eq!(h.driver.stats().flush_failures, 2);
        assert_eq!(h.driver.stats().max_consecutive_flush_failures, 2);
        assert_eq!(h.store.rows_written(), 1);
        assert_eq!(*h.committed.lock(), vec![cursor(1_000)]);
    }

    #[tokio::test]
    async fn poll_errors_are_counted_and_survived() {
        let script = vec![
            Step::Fail,
            Step::Trades(vec![sourced(1_000, 1.0)]),
            Step::Fail,
        ];
        let mut h = harness(&config(), script, true);

        let outcome = h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Exhausted);
        assert_eq!(h.driver.stats().poll_errors, 2);
        assert_eq!(h.driver.stats().trades_seen, 1);
    }

    #[tokio::test]
    async fn late_trades_are_counted_and_do_not_pin_commits() {
        let mut config = config();
        config.routing.persist_trades = false;
        let script = vec![Step::Trades(vec![
            sourced(1_000, 1.0),
            sourced(61_000, 2.0),
            sourced(2_000, 3.0),
        ])];
        let mut h = harness(&config, script, true);

        h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        assert_eq!(h.driver.stats().late_trades_dropped, 1);
        assert_eq!(rows_in(&h.store, "ohlc_feature_group"), 2);
        assert_eq!(*h.committed.lock(), vec![cursor(61_000)]);
    }

    #[tokio::test]
    async fn cancellation_flushes_once_without_emitting_open_windows() {
        let script = vec![Step::Trades(vec![sourced(1_000, 1.0), sourced(61_000, 2.0)])];
        let mut h = harness(&config(), script, false);

        let outcome = h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled);
        // Only the window closed by the watermark; the open one stays open.
        assert_eq!(rows_in(&h.store, "ohlc_feature_group"), 1);
        assert_eq!(*h.committed.lock(), vec![cursor(1_000)]);
    }

    #[tokio::test]
    async fn open_window_on_shared_partition_holds_back_commit() {
        let mut config = config();
        config.routing.persist_trades = false;
        // ETH opens a window at offset 0; BTC closes one of its own behind it.
        let script = vec![Step::Trades(vec![
            logged("ETH/USD", 1_000, 0),
            logged("BTC/USD", 1_000, 1),
            logged("BTC/USD", 61_000, 2),
        ])];
        let mut h = harness(&config, script, false);

        h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        assert_eq!(rows_in(&h.store, "ohlc_feature_group"), 1);
        // Committing offset 1 would skip the ETH trade still in its window.
        assert!(h.committed.lock().is_empty());
    }

    #[tokio::test]
    async fn cancellation_with_failed_flush_commits_nothing() {
        let mut config = config();
        config.routing.aggregate_candles = false;
        let mut h = harness(&config, vec![Step::Trades(vec![sourced(1_000, 1.0)])], false);
        h.store.fail_next(usize::MAX);

        let outcome = h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(h.committed.lock().is_empty());
        assert_eq!(h.driver.buffered(), 1);
        assert_eq!(h.driver.stats().flush_failures, 1);
    }

    #[tokio::test]
    async fn stop_before_first_poll_returns_immediately() {
        let mut h = harness(&config(), vec![Step::Trades(vec![sourced(1_000, 1.0)])], true);
        h.shutdown_tx.send(true).unwrap();

        let outcome = h.driver.run(h.shutdown_rx.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(h.driver.stats().trades_seen, 0);
        assert_eq!(h.store.state.lock().attempts, 0);
    }
}
