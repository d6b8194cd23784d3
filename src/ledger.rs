// =============================================================================
// Commit Ledger — which source positions are safe to acknowledge
// =============================================================================
//
// Every trade taken from a source registers its position with one hold per
// record it feeds (the raw trade, the candle it lands in). A flush releases
// the holds of the records it wrote. Per stream, the commit frontier is the
// newest position with no unreleased position at or before it; only the
// frontier is ever handed to the source.
//
// Streams are what a cursor orders within: an instrument for venue and
// backfill cursors, a (topic, partition) for log cursors. On a shared
// partition an instrument's still-open window therefore pins the frontier
// for every instrument behind it.
// =============================================================================

use std::collections::BTreeMap;

use tracing::debug;

use crate::types::SourceCursor;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum StreamKey {
    Live(String),
    Backfill(String),
    Log(String, i32),
}

fn locate(cursor: &SourceCursor) -> (StreamKey, i64) {
    match cursor {
        SourceCursor::Live {
            instrument_id,
            trade_id,
        } => (
            StreamKey::Live(instrument_id.clone()),
            i64::try_from(*trade_id).unwrap_or(i64::MAX),
        ),
        SourceCursor::Backfill {
            instrument_id,
            timestamp_ms,
        } => (StreamKey::Backfill(instrument_id.clone()), *timestamp_ms),
        SourceCursor::Log {
            topic,
            partition,
            offset,
        } => (StreamKey::Log(topic.clone(), *partition), *offset),
    }
}

fn cursor_at(key: &StreamKey, position: i64) -> SourceCursor {
    match key {
        StreamKey::Live(instrument_id) => SourceCursor::Live {
            instrument_id: instrument_id.clone(),
            trade_id: u64::try_from(position).unwrap_or(0),
        },
        StreamKey::Backfill(instrument_id) => SourceCursor::Backfill {
            instrument_id: instrument_id.clone(),
            timestamp_ms: position,
        },
        StreamKey::Log(topic, partition) => SourceCursor::Log {
            topic: topic.clone(),
            partition: *partition,
            offset: position,
        },
    }
}

#[derive(Debug, Default)]
pub struct CommitLedger {
    /// Stream -> position -> holds not yet released.
    pending: BTreeMap<StreamKey, BTreeMap<i64, u32>>,
}

impl CommitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a position with `holds` records still to be written. Zero
    /// holds (a trade that fed nothing) is immediately releasable.
    pub fn hold(&mut self, cursor: &SourceCursor, holds: u32) {
        let (key, position) = locate(cursor);
        *self
            .pending
            .entry(key)
            .or_default()
            .entry(position)
            .or_insert(0) += holds;
    }

    /// One record carrying `cursor` was written.
    pub fn release(&mut self, cursor: &SourceCursor) {
        let (key, position) = locate(cursor);
        if let Some(holds) = self
            .pending
            .get_mut(&key)
            .and_then(|stream| stream.get_mut(&position))
        {
            *holds = holds.saturating_sub(1);
        }
    }

    /// Advance every stream's frontier over fully released positions and
    /// return the new frontier of each stream that moved.
    pub fn take_committable(&mut self) -> Vec<SourceCursor> {
        let mut ready = Vec::new();
        for (key, stream) in self.pending.iter_mut() {
            let mut frontier = None;
            while let Some(entry) = stream.first_entry() {
                if *entry.get() > 0 {
                    break;
                }
                frontier = Some(entry.remove_entry().0);
            }
            if let Some(position) = frontier {
                ready.push(cursor_at(key, position));
            }
        }
        self.pending.retain(|_, stream| !stream.is_empty());
        if !ready.is_empty() {
            debug!(streams = ready.len(), "commit frontier advanced");
        }
        ready
    }

    /// Positions still waiting on a write.
    pub fn outstanding(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(partition: i32, offset: i64) -> SourceCursor {
        SourceCursor::Log {
            topic: "trades".into(),
            partition,
            offset,
        }
    }

    fn backfill(instrument: &str, ts: i64) -> SourceCursor {
        SourceCursor::Backfill {
            instrument_id: instrument.into(),
            timestamp_ms: ts,
        }
    }

    #[test]
    fn frontier_stops_at_first_unreleased_position() {
        let mut ledger = CommitLedger::new();
        for o in 1..=3 {
            ledger.hold(&offset(0, o), 1);
        }
        ledger.release(&offset(0, 2));
        ledger.release(&offset(0, 3));
        assert!(ledger.take_committable().is_empty());

        ledger.release(&offset(0, 1));
        assert_eq!(ledger.take_committable(), vec![offset(0, 3)]);
        assert_eq!(ledger.outstanding(), 0);
        assert!(ledger.take_committable().is_empty());
    }

    #[test]
    fn open_window_on_shared_partition_pins_later_offsets() {
        let mut ledger = CommitLedger::new();
        // ETH trade sits in an open window; BTC trades behind it are written.
        ledger.hold(&offset(0, 10), 1);
        ledger.hold(&offset(0, 11), 1);
        ledger.hold(&offset(0, 12), 1);
        ledger.release(&offset(0, 11));
        ledger.release(&offset(0, 12));
        assert!(ledger.take_committable().is_empty());
        assert_eq!(ledger.outstanding(), 3);
    }

    #[test]
    fn every_hold_must_be_released() {
        let mut ledger = CommitLedger::new();
        ledger.hold(&backfill("X", 1_000), 2);
        ledger.release(&backfill("X", 1_000));
        assert!(ledger.take_committable().is_empty());
        ledger.release(&backfill("X", 1_000));
        assert_eq!(ledger.take_committable(), vec![backfill("X", 1_000)]);
    }

    #[test]
    fn zero_hold_positions_pass_straight_through() {
        let mut ledger = CommitLedger::new();
        ledger.hold(&backfill("X", 1_000), 0);
        assert_eq!(ledger.take_committable(), vec![backfill("X", 1_000)]);
    }

    #[test]
    fn streams_advance_independently() {
        let mut ledger = CommitLedger::new();
        ledger.hold(&backfill("A", 1_000), 1);
        ledger.hold(&backfill("B", 2_000), 1);
        ledger.hold(&offset(1, 5), 1);
        ledger.release(&backfill("B", 2_000));
        ledger.release(&offset(1, 5));
        let mut ready = ledger.take_committable();
        ready.sort_by_key(|c| format!("{c:?}"));
        assert_eq!(ready, vec![backfill("B", 2_000), offset(1, 5)]);
        assert_eq!(ledger.outstanding(), 1);
    }

    #[test]
    fn live_positions_round_trip_trade_ids() {
        let mut ledger = CommitLedger::new();
        let cursor = SourceCursor::Live {
            instrument_id: "BTC/USD".into(),
            trade_id: 42,
        };
        ledger.hold(&cursor, 1);
        ledger.release(&cursor);
        assert_eq!(ledger.take_committable(), vec![cursor]);
    }
}
