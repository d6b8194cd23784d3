// =============================================================================
// Shared types used across the OHLC pipeline
// =============================================================================

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A single feature-store row: feature name -> value.
pub type FeatureRow = Map<String, Value>;

/// 9999-12-31T23:59:59.999Z. Later timestamps are rejected so window
/// arithmetic stays far from `i64` overflow.
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

// =============================================================================
// Trade
// =============================================================================

/// A normalized trade event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    instrument_id: String,
    price: f64,
    volume: f64,
    /// Event time from the venue (UTC, epoch milliseconds).
    timestamp_ms: i64,
}

impl Trade {
    /// Build a trade, rejecting values that would corrupt a candle.
    pub fn new(
        instrument_id: impl Into<String>,
        price: f64,
        volume: f64,
        timestamp_ms: i64,
    ) -> Result<Self> {
        let instrument_id = instrument_id.into();
        if instrument_id.is_empty() {
            bail!("trade has an empty instrument id");
        }
        if !price.is_finite() || price <= 0.0 {
            bail!("trade price must be positive, got {price}");
        }
        if !volume.is_finite() || volume < 0.0 {
            bail!("trade volume must be non-negative, got {volume}");
        }
        if timestamp_ms <= 0 || timestamp_ms > MAX_TIMESTAMP_MS {
            bail!("trade timestamp out of range, got {timestamp_ms}");
        }
        Ok(Self {
            instrument_id,
            price,
            volume,
            timestamp_ms,
        })
    }

    pub fn instrument_id(&self) -> &str {
        &self.instrument_id
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn to_feature_row(&self) -> FeatureRow {
        let mut row = Map::new();
        row.insert("instrument_id".into(), json!(self.instrument_id));
        row.insert("price".into(), json!(self.price));
        row.insert("volume".into(), json!(self.volume));
        row.insert("timestamp_ms".into(), json!(self.timestamp_ms));
        row
    }
}

// =============================================================================
// Candle
// =============================================================================

/// A finalized OHLC candle for one instrument and one tumbling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument_id: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Sum of trade volumes folded into the window.
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub trade_count: u64,
}

impl Candle {
    /// Feature row keyed by field name. `timestamp_ms` is the window end, which
    /// is what downstream feature groups use as the event time of a candle.
    pub fn to_feature_row(&self) -> FeatureRow {
        let mut row = Map::new();
        row.insert("instrument_id".into(), json!(self.instrument_id));
        row.insert("window_start_ms".into(), json!(self.window_start_ms));
        row.insert("window_end_ms".into(), json!(self.window_end_ms));
        row.insert("timestamp_ms".into(), json!(self.window_end_ms));
        row.insert("open".into(), json!(self.open));
        row.insert("high".into(), json!(self.high));
        row.insert("low".into(), json!(self.low));
        row.insert("close".into(), json!(self.close));
        row.insert("volume".into(), json!(self.volume));
        row.insert("trade_count".into(), json!(self.trade_count));
        row
    }
}

// =============================================================================
// Record
// =============================================================================

/// Anything the buffered sink can deliver downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Trade(Trade),
    Candle(Candle),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Trade(_) => RecordKind::Trade,
            Self::Candle(_) => RecordKind::Candle,
        }
    }

    pub fn to_feature_row(&self) -> FeatureRow {
        match self {
            Self::Trade(t) => t.to_feature_row(),
            Self::Candle(c) => c.to_feature_row(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Trade,
    Candle,
}

// =============================================================================
// Modes
// =============================================================================

/// Where the trades come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Live,
    Historical,
}

impl Default for SourceMode {
    fn default() -> Self {
        Self::Live
    }
}

impl SourceMode {
    /// Live data feeds the low-latency store, backfills go to the batch store.
    pub fn default_destination(self) -> WriteMode {
        match self {
            Self::Live => WriteMode::Online,
            Self::Historical => WriteMode::Offline,
        }
    }
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Historical => write!(f, "historical"),
        }
    }
}

impl std::str::FromStr for SourceMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "historical" => Ok(Self::Historical),
            other => bail!("invalid source mode '{other}', expected 'live' or 'historical'"),
        }
    }
}

/// Feature-store destination tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Online,
    Offline,
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

// =============================================================================
// SourceCursor
// =============================================================================

/// Opaque position token handed out by a trade source alongside each trade.
/// Only the source that produced it knows how to commit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceCursor {
    Live { instrument_id: String, trade_id: u64 },
    Backfill { instrument_id: String, timestamp_ms: i64 },
    Log { topic: String, partition: i32, offset: i64 },
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_rejects_invariant_violations() {
        assert!(Trade::new("XBT/USD", 0.0, 1.0, 1).is_err());
        assert!(Trade::new("XBT/USD", -5.0, 1.0, 1).is_err());
        assert!(Trade::new("XBT/USD", f64::NAN, 1.0, 1).is_err());
        assert!(Trade::new("XBT/USD", 10.0, -1.0, 1).is_err());
        assert!(Trade::new("XBT/USD", 10.0, 1.0, 0).is_err());
        assert!(Trade::new("XBT/USD", 10.0, 1.0, i64::MAX).is_err());
        assert!(Trade::new("XBT/USD", 10.0, 1.0, MAX_TIMESTAMP_MS + 1).is_err());
        assert!(Trade::new("XBT/USD", 10.0, 1.0, MAX_TIMESTAMP_MS).is_ok());
        assert!(Trade::new("", 10.0, 1.0, 1).is_err());
        assert!(Trade::new("XBT/USD", 10.0, 0.0, 1).is_ok());
    }

    #[test]
    fn candle_wire_roundtrip() {
        let candle = Candle {
            instrument_id: "ETH/USD".into(),
            window_start_ms: 1_717_667_940_000,
            window_end_ms: 1_717_668_000_000,
            open: 3535.98,
            high: 3537.11,
            low: 3535.5,
            close: 3537.11,
            volume: 12.25,
            trade_count: 7,
        };
        let json = serde_json::to_string(&candle).unwrap();
        let back: Candle = serde_json::from_str(&json).unwrap();
        assert_eq!(candle, back);
    }

    #[test]
    fn candle_wire_uses_field_names() {
        let json = r#"{
            "instrument_id": "X", "window_start_ms": 0, "window_end_ms": 60000,
            "open": 100.0, "high": 110.0, "low": 100.0, "close": 110.0
        }"#;
        let candle: Candle = serde_json::from_str(json).unwrap();
        assert_eq!(candle.window_end_ms, 60_000);
        assert_eq!(candle.trade_count, 0);
    }

    #[test]
    fn candle_feature_row_carries_window_end_timestamp() {
        let candle = Candle {
            instrument_id: "X".into(),
            window_start_ms: 0,
            window_end_ms: 60_000,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
            trade_count: 2,
        };
        let row = candle.to_feature_row();
        assert_eq!(row["timestamp_ms"], json!(60_000));
        assert_eq!(row["instrument_id"], json!("X"));
    }

    #[test]
    fn source_mode_parses_and_routes() {
        assert_eq!("LIVE".parse::<SourceMode>().unwrap(), SourceMode::Live);
        assert_eq!(" historical ".parse::<SourceMode>().unwrap(), SourceMode::Historical);
        assert!("replay".parse::<SourceMode>().is_err());
        assert_eq!(SourceMode::Live.default_destination(), WriteMode::Online);
        assert_eq!(SourceMode::Historical.default_destination(), WriteMode::Offline);
    }
}
