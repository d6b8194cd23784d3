// =============================================================================
// Kraken v2 WebSocket — wire messages for the public trade channel
// =============================================================================
//
// Only the `trade` channel carries data. Everything else the venue pushes on
// the same connection (heartbeat, status, subscribe acknowledgements) is a
// control message and must be skipped without error.
// =============================================================================

use anyhow::{Context, Result};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::json;

/// One trade as Kraken publishes it on the `trade` channel.
///
/// ```json
/// { "symbol": "BTC/USD", "side": "buy", "price": 64230.1, "qty": 0.0012,
///   "ord_type": "market", "trade_id": 72910438,
///   "timestamp": "2024-06-17T09:36:39.467866Z" }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct WsTrade {
    pub symbol: String,
    pub price: f64,
    pub qty: f64,
    pub timestamp: String,
    #[serde(default)]
    pub trade_id: u64,
}

/// Decoded frame from the trade connection.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// Heartbeat, status or subscription acknowledgement.
    Control(String),
    /// The venue refused a request (e.g. unknown symbol).
    Rejected(String),
    Trades(Vec<WsTrade>),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Build the subscribe request for the trade channel of `instruments`.
pub fn subscribe_request(instruments: &[String]) -> String {
    json!({
        "method": "subscribe",
        "params": {
            "channel": "trade",
            "symbol": instruments,
            "snapshot": false,
        }
    })
    .to_string()
}

/// Decode one text frame.
pub fn parse_feed_message(text: &str) -> Result<FeedMessage> {
    let envelope: Envelope =
        serde_json::from_str(text).context("failed to parse Kraken WebSocket JSON")?;

    if let Some(method) = envelope.method {
        if envelope.success == Some(false) {
            let reason = envelope.error.unwrap_or_else(|| "unknown error".to_string());
            return Ok(FeedMessage::Rejected(format!("{method}: {reason}")));
        }
        return Ok(FeedMessage::Control(method));
    }

    let channel = envelope.channel.context("message has neither method nor channel")?;
    if channel != "trade" {
        return Ok(FeedMessage::Control(channel));
    }

    let data = envelope.data.context("trade message missing data")?;
    let trades: Vec<WsTrade> =
        serde_json::from_value(data).context("trade message data is malformed")?;
    Ok(FeedMessage::Trades(trades))
}

/// Convert an ISO-8601 UTC timestamp such as `2024-06-17T09:36:39.467866Z` to
/// epoch milliseconds (sub-millisecond digits are truncated).
pub fn iso8601_to_ms(timestamp: &str) -> Result<i64> {
    let parsed = DateTime::parse_from_rfc3339(timestamp)
        .with_context(|| format!("invalid ISO-8601 timestamp: {timestamp}"))?;
    Ok(parsed.timestamp_millis())
}

// =============================================================================
// Tests
// =============================================================================
