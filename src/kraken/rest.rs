// =============================================================================
// Kraken REST API Client — public trade history
// =============================================================================
//
// GET /0/public/Trades?pair=<pair>&since=<ns>
//
// Response shape:
//   { "error": [], "result": { "<pair key>": [[price, volume, time, side,
//     type, misc, trade_id], ...], "last": "<ns cursor>" } }
//
// Price and volume arrive as strings, time as fractional epoch seconds. The
// pair key in `result` is Kraken's internal name (e.g. `XXBTZUSD`) and need
// not match the requested pair; the first array-valued entry is the fallback.
// `last` is the nanosecond cursor to send as `since` for the next page.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::source::historical::{HistoryPage, TradeHistoryApi, TradePage};
use crate::types::Trade;

/// Error strings Kraken uses for throttling.
const RATE_LIMIT_ERRORS: &[&str] = &["EGeneral:Too many requests", "EAPI:Rate limit exceeded"];

/// Kraken public REST client.
#[derive(Clone)]
pub struct KrakenRestClient {
    base_url: String,
    client: reqwest::Client,
}

impl KrakenRestClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build reqwest client for Kraken REST")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "KrakenRestClient initialised");

        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl TradeHistoryApi for KrakenRestClient {
    #[instrument(skip(self), name = "kraken::fetch_trades")]
    async fn fetch_page(&self, instrument_id: &str, since_ns: i64) -> Result<HistoryPage> {
        let url = format!("{}/0/public/Trades", self.base_url);
        let since_ns = since_ns.to_string();

        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .query(&[("pair", instrument_id), ("since", since_ns.as_str())])
            .send()
            .await
            .with_context(|| format!("GET /0/public/Trades for {instrument_id}"))?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(HistoryPage::RateLimited);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse Trades response body")?;

        if !status.is_success() {
            anyhow::bail!("Kraken GET /0/public/Trades returned {}: {}", status, body);
        }

        parse_trades_response(&body, instrument_id)
    }
}

/// Turn a Trades response body into a page for `instrument_id`.
///
/// Rows that cannot be parsed or that violate trade invariants are dropped
/// with a warning; they never fail the whole page.
pub fn parse_trades_response(body: &serde_json::Value, instrument_id: &str) -> Result<HistoryPage> {
    let errors: Vec<&str> = body["error"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|e| e.as_str()).collect())
        .unwrap_or_default();

    if errors
        .iter()
        .any(|e| RATE_LIMIT_ERRORS.iter().any(|rl| e.starts_with(rl)))
    {
        return Ok(HistoryPage::RateLimited);
    }
    if !errors.is_empty() {
        anyhow::bail!("Kraken Trades error for {instrument_id}: {}", errors.join(", "));
    }

    let result = body["result"]
        .as_object()
        .context("Trades response missing 'result' object")?;

    let rows = result
        .get(instrument_id)
        .and_then(|v| v.as_array())
        .or_else(|| {
            result
                .iter()
                .filter(|(key, _)| key.as_str() != "last")
                .find_map(|(_, v)| v.as_array())
        })
        .context("Trades response has no trade array")?;

    let mut trades = Vec::with_capacity(rows.len());
    for row in rows {
        match parse_row(row, instrument_id) {
            Ok(trade) => trades.push(trade),
            Err(e) => warn!(instrument = %instrument_id, error = %e, "dropping malformed trade row"),
        }
    }

    let next_since_ns = result.get("last").and_then(|v| {
        v.as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| v.as_i64())
    });

    debug!(instrument = %instrument_id, rows = rows.len(), kept = trades.len(), ?next_since_ns, "trade page parsed");
    Ok(HistoryPage::Trades(TradePage {
        trades,
        raw_rows: rows.len(),
        last_raw_ms: rows.last().and_then(row_time_ms),
        next_since_ns,
    }))
}

fn parse_row(row: &serde_json::Value, instrument_id: &str) -> Result<Trade> {
    let arr = row.as_array().context("trade row is not an array")?;
    if arr.len() < 3 {
        anyhow::bail!("trade row has {} elements, expected at least 3", arr.len());
    }
    let price = parse_str_f64(&arr[0]).context("bad price")?;
    let volume = parse_str_f64(&arr[1]).context("bad volume")?;
    let timestamp_ms = secs_to_ms(parse_str_f64(&arr[2]).context("bad time")?);
    Trade::new(instrument_id, price, volume, timestamp_ms)
}

/// Event time of a row whose other fields may be unusable.
fn row_time_ms(row: &serde_json::Value) -> Option<i64> {
    let time = row.as_array()?.get(2)?;
    parse_str_f64(time).ok().filter(|s| s.is_finite()).map(secs_to_ms)
}

fn secs_to_ms(secs: f64) -> i64 {
    (secs * 1000.0) as i64
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

impl std::fmt::Debug for KrakenRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenRestClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
