// =============================================================================
// Buffered Sink — batches records and flushes them under a size/time policy
// =============================================================================
//
// `ingest` only appends. `maybe_flush` decides whether to write:
//
//   - buffer length reached `max_batch_size`
//   - `force` was requested
//   - `max_flush_interval_ms` elapsed since the last successful flush
//
// One sink serves one feature group, so a flush is a single store call with
// the whole buffer. (Entries tagged with different destinations are written
// one call per destination; the pipeline never mixes them.) The buffer is
// cleared and `last_flush_ms` advanced only when the write succeeds; on
// failure both are left untouched so the next tick retries the same entries.
//
// The sink never commits cursors. It hands the flushed ones back and the
// driver decides.
// =============================================================================

pub mod feature_store;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::types::{FeatureRow, Record, SourceCursor, WriteMode};

pub use feature_store::{build_feature_store, FeatureGroup, FeatureStore};

/// One buffered record, its destination tag and the source positions it
/// releases once written.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    pub record: Record,
    pub destination: WriteMode,
    pub cursors: Vec<SourceCursor>,
}

impl BufferEntry {
    pub fn new(record: Record, destination: WriteMode, cursors: Vec<SourceCursor>) -> Self {
        Self {
            record,
            destination,
            cursors,
        }
    }
}

/// Outcome of one `maybe_flush` call.
#[derive(Debug)]
pub enum FlushResult {
    /// No trigger fired, or the buffer was empty.
    Skipped,
    /// Everything was written. `cursors` are released.
    Flushed {
        entries: usize,
        cursors: Vec<SourceCursor>,
    },
    /// The store call failed; the buffer is unchanged.
    Failed { consecutive_failures: u32 },
}

impl FlushResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

pub struct BufferedSink {
    store: Arc<dyn FeatureStore>,
    group: FeatureGroup,
    buffer: Vec<BufferEntry>,
    max_batch_size: usize,
    max_flush_interval_ms: u64,
    last_flush_ms: i64,
    consecutive_failures: u32,
}

impl BufferedSink {
    /// `now_ms` seeds the flush timer.
    pub fn new(
        store: Arc<dyn FeatureStore>,
        group: FeatureGroup,
        max_batch_size: usize,
        max_flush_interval_ms: u64,
        now_ms: i64,
    ) -> Self {
        Self {
            store,
            group,
            buffer: Vec::with_capacity(max_batch_size),
            max_batch_size,
            max_flush_interval_ms,
            last_flush_ms: now_ms,
            consecutive_failures: 0,
        }
    }

    /// Append an entry. Never performs I/O.
    pub fn ingest(&mut self, entry: BufferEntry) {
        self.buffer.push(entry);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The size trigger would fire on the next `maybe_flush`; ingesting now
    /// would overrun the bound.
    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_batch_size
    }

    pub fn group(&self) -> &FeatureGroup {
        &self.group
    }

    #[cfg(test)]
    pub fn last_flush_ms(&self) -> i64 {
        self.last_flush_ms
    }

    #[cfg(test)]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn should_flush(&self, now_ms: i64, force: bool) -> bool {
        force
            || self.is_full()
            || now_ms.saturating_sub(self.last_flush_ms) >= self.max_flush_interval_ms as i64
    }

    /// Rows per destination, in order of first appearance.
    fn batches(&self) -> Vec<(WriteMode, Vec<FeatureRow>)> {
        let mut batches: Vec<(WriteMode, Vec<FeatureRow>)> = Vec::new();
        for entry in &self.buffer {
            let row = entry.record.to_feature_row();
            match batches.iter_mut().find(|(mode, _)| *mode == entry.destination) {
                Some((_, rows)) => rows.push(row),
                None => batches.push((entry.destination, vec![row])),
            }
        }
        batches
    }

    /// Flush if a trigger fires. See the module header for the contract.
    pub async fn maybe_flush(&mut self, now_ms: i64, force: bool) -> FlushResult {
        if self.is_empty() || !self.should_flush(now_ms, force) {
            return FlushResult::Skipped;
        }

        let entries = self.buffer.len();
        let mut outcome: anyhow::Result<()> = Ok(());
        for (mode, rows) in self.batches() {
            if let Err(e) = self.store.write(&rows, &self.group, mode).await {
                outcome = Err(e.context(format!(
                    "write of {} rows to {} ({}) failed",
                    rows.len(),
                    self.group,
                    mode
                )));
                break;
            }
        }

        match outcome {
            Ok(()) => {
                let cursors: Vec<SourceCursor> = self
                    .buffer
                    .drain(..)
                    .flat_map(|entry| entry.cursors)
                    .collect();
                self.last_flush_ms = now_ms;
                self.consecutive_failures = 0;
                debug!(
                    group = %self.group,
                    entries,
                    cursors = cursors.len(),
                    backend = self.store.backend_type(),
                    "buffer flushed"
                );
                FlushResult::Flushed { entries, cursors }
            }
            Err(error) => {
                self.consecutive_failures += 1;
                warn!(
                    group = %self.group,
                    entries,
                    consecutive_failures = self.consecutive_failures,
                    error = %format!("{error:#}"),
                    "flush failed; buffer retained"
                );
                FlushResult::Failed {
                    consecutive_failures: self.consecutive_failures,
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::types::{Candle, Trade};

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct WriteCall {
        pub group: FeatureGroup,
        pub mode: WriteMode,
        pub rows: Vec<FeatureRow>,
    }

    #[derive(Default)]
    pub(crate) struct StoreState {
        pub calls: Vec<WriteCall>,
        pub attempts: usize,
        /// Number of upcoming writes that fail.
        pub fail_next: usize,
    }

    /// Records every successful write; fails on demand.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingStore {
        pub state: Arc<Mutex<StoreState>>,
    }

    impl RecordingStore {
        pub fn fail_next(&self, n: usize) {
            self.state.lock().fail_next = n;
        }

        pub fn calls(&self) -> Vec<WriteCall> {
            self.state.lock().calls.clone()
        }

        pub fn rows_written(&self) -> usize {
            self.state.lock().calls.iter().map(|c| c.rows.len()).sum()
        }
    }

    #[async_trait]
    impl FeatureStore for RecordingStore {
        async fn write(&self, rows: &[FeatureRow], group: &FeatureGroup, mode: WriteMode) -> Result<()> {
            let mut state = self.state.lock();
            state.attempts += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                bail!("store unavailable");
            }
            state.calls.push(WriteCall {
                group: group.clone(),
                mode,
                rows: rows.to_vec(),
            });
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "recording"
        }
    }

    fn sink(store: &RecordingStore, max_batch_size: usize, interval_ms: u64) -> BufferedSink {
        BufferedSink::new(
            Arc::new(store.clone()),
            FeatureGroup::new("trades", 1),
            max_batch_size,
            interval_ms,
            0,
        )
    }

    fn trade_entry(ts: i64) -> BufferEntry {
        BufferEntry::new(
            Record::Trade(Trade::new("BTC/USD", 100.0, 1.0, ts).unwrap()),
            WriteMode::Online,
            vec![cursor(ts)],
        )
    }

    fn cursor(ts: i64) -> SourceCursor {
        SourceCursor::Backfill {
            instrument_id: "BTC/USD".into(),
            timestamp_ms: ts,
        }
    }

    fn candle_entry(end: i64) -> BufferEntry {
        BufferEntry::new(
            Record::Candle(Candle {
                instrument_id: "BTC/USD".into(),
                window_start_ms: end - 60_000,
                window_end_ms: end,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
                trade_count: 1,
            }),
            WriteMode::Online,
            vec![cursor(end - 2), cursor(end - 1)],
        )
    }

    #[tokio::test]
    async fn forced_flush_writes_partial_buffer() {
        let store = RecordingStore::default();
        let mut sink = sink(&store, 3, 60_000);
        sink.ingest(trade_entry(1));
        sink.ingest(trade_entry(2));

        match sink.maybe_flush(10, true).await {
            FlushResult::Flushed { entries, cursors } => {
                assert_eq!(entries, 2);
                assert_eq!(cursors.len(), 2);
            }
            other => panic!("expected flush, got {other:?}"),
        }
        assert!(sink.is_empty());
        assert_eq!(sink.last_flush_ms(), 10);
        assert_eq!(store.calls().len(), 1);
        assert_eq!(store.rows_written(), 2);
    }

    #[tokio::test]
    async fn no_trigger_means_no_write() {
        let store = RecordingStore::default();
        let mut sink = sink(&store, 3, 60_000);
        sink.ingest(trade_entry(1));
        assert!(matches!(sink.maybe_flush(10, false).await, FlushResult::Skipped));
        assert_eq!(sink.len(), 1);
        assert_eq!(store.state.lock().attempts, 0);
    }

    #[tokio::test]
    async fn size_trigger_flushes_at_bound() {
        let store = RecordingStore::default();
        let mut sink = sink(&store, 3, 60_000);
        for ts in 1..=3 {
            sink.ingest(trade_entry(ts));
        }
        assert!(sink.is_full());
        assert!(matches!(
            sink.maybe_flush(5, false).await,
            FlushResult::Flushed { entries: 3, .. }
        ));
        assert!(!sink.is_full());
    }

    #[tokio::test]
    async fn time_trigger_bounds_staleness_for_sparse_input() {
        let store = RecordingStore::default();
        let mut sink = sink(&store, 100, 1_000);
        sink.ingest(trade_entry(1));
        assert!(matches!(sink.maybe_flush(999, false).await, FlushResult::Skipped));
        assert!(matches!(
            sink.maybe_flush(1_000, false).await,
            FlushResult::Flushed { entries: 1, .. }
        ));

        // Timer restarts from the successful flush.
        sink.ingest(trade_entry(2));
        assert!(matches!(sink.maybe_flush(1_500, false).await, FlushResult::Skipped));
        assert!(matches!(
            sink.maybe_flush(2_000, false).await,
            FlushResult::Flushed { .. }
        ));
    }

    #[tokio::test]
    async fn empty_buffer_never_writes() {
        let store = RecordingStore::default();
        let mut sink = sink(&store, 1, 1);
        assert!(matches!(sink.maybe_flush(10_000, true).await, FlushResult::Skipped));
        assert_eq!(store.state.lock().attempts, 0);
        assert_eq!(sink.last_flush_ms(), 0);
    }

    #[tokio::test]
    async fn failed_flush_retains_buffer_and_timer() {
        let store = RecordingStore::default();
        let mut sink = sink(&store, 3, 60_000);
        sink.ingest(trade_entry(1));
        sink.ingest(trade_entry(2));
        store.fail_next(1);

        let result = sink.maybe_flush(50, true).await;
        assert!(result.is_failed());
        assert!(matches!(
            result,
            FlushResult::Failed { consecutive_failures: 1, .. }
        ));
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.last_flush_ms(), 0);
        assert_eq!(sink.consecutive_failures(), 1);

        // Retry carries exactly the original entries, once each.
        match sink.maybe_flush(60, true).await {
            FlushResult::Flushed { entries, cursors } => {
                assert_eq!(entries, 2);
                assert_eq!(cursors, vec![cursor(1), cursor(2)]);
            }
            other => panic!("expected flush, got {other:?}"),
        }
        assert_eq!(store.rows_written(), 2);
        assert_eq!(sink.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn flush_is_one_write_with_every_row() {
        let store = RecordingStore::default();
        let mut sink = BufferedSink::new(
            Arc::new(store.clone()),
            FeatureGroup::new("ohlc_feature_group", 1),
            10,
            60_000,
            0,
        );
        sink.ingest(candle_entry(60_000));
        sink.ingest(candle_entry(120_000));
        sink.ingest(candle_entry(180_000));

        match sink.maybe_flush(1, true).await {
            FlushResult::Flushed { entries, cursors } => {
                assert_eq!(entries, 3);
                // A candle releases every trade folded into it.
                assert_eq!(cursors.len(), 6);
                assert_eq!(cursors[0], cursor(59_998));
            }
            other => panic!("expected flush, got {other:?}"),
        }

        let calls = store.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].group, FeatureGroup::new("ohlc_feature_group", 1));
        assert_eq!(calls[0].mode, WriteMode::Online);
        assert_eq!(calls[0].rows.len(), 3);
        assert_eq!(calls[0].rows[2]["timestamp_ms"], serde_json::json!(180_000));
    }

    #[tokio::test]
    async fn mixed_destinations_write_in_arrival_order() {
        let store = RecordingStore::default();
        let mut sink = sink(&store, 10, 60_000);
        sink.ingest(trade_entry(1));
        let mut offline = trade_entry(2);
        offline.destination = WriteMode::Offline;
        sink.ingest(offline);
        sink.ingest(trade_entry(3));

        assert!(matches!(
            sink.maybe_flush(1, true).await,
            FlushResult::Flushed { entries: 3, .. }
        ));
        let calls = store.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].mode, calls[0].rows.len()), (WriteMode::Online, 2));
        assert_eq!((calls[1].mode, calls[1].rows.len()), (WriteMode::Offline, 1));
    }

    #[tokio::test]
    async fn partial_write_failure_retains_everything() {
        let mut sink = BufferedSink::new(
            Arc::new(FailSecond::default()),
            FeatureGroup::new("trades", 1),
            10,
            60_000,
            0,
        );
        sink.ingest(trade_entry(1));
        let mut offline = trade_entry(2);
        offline.destination = WriteMode::Offline;
        sink.ingest(offline);

        let result = sink.maybe_flush(1, true).await;
        assert!(result.is_failed());
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.last_flush_ms(), 0);
    }
    /// Accepts the first write, rejects the rest.
    #[derive(Default)]
    struct FailSecond {
        writes: Mutex<usize>,
    }

    #[async_trait]
    impl FeatureStore for FailSecond {
        async fn write(&self, _rows: &[FeatureRow], _group: &FeatureGroup, _mode: WriteMode) -> Result<()> {
            let mut writes = self.writes.lock();
            *writes += 1;
            if *writes > 1 {
                bail!("second write rejected");
            }
            Ok(())
        }

        fn backend_type(&self) -> &'static str {
            "fail-second"
        }
    }
}
