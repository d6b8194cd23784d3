// =============================================================================
// Live Trade Source — Kraken v2 WebSocket trade channel
// =============================================================================
//
// One persistent connection per process, subscribed to every configured
// instrument. Each `poll` performs at most one bounded receive:
//
//   - timeout            => empty batch (lets the driver run its flush timer)
//   - control message    => empty batch
//   - malformed payload  => warning + empty batch
//   - disconnect / error => connection dropped, reconnect on the next poll
//
// The venue cannot replay, so commits only track the acknowledged high-water
// trade id per instrument. Replayable live ingestion goes through the log:
// this source feeds the trades topic and a log-sourced pipeline reads it.
//
// Event time always comes from the payload, never from the local clock, so
// late-arriving messages still land in the right window.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::LiveConfig;
use crate::kraken::ws::{iso8601_to_ms, parse_feed_message, subscribe_request, FeedMessage, WsTrade};
use crate::source::{SourcedTrade, TradeSource};
use crate::types::{SourceCursor, SourceMode, Trade};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Counters for what the live feed has delivered and discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveStats {
    pub trades: u64,
    pub control_messages: u64,
    pub malformed_messages: u64,
    pub invalid_trades: u64,
    pub connects: u64,
}

pub struct LiveTradeSource {
    url: String,
    instruments: Vec<String>,
    recv_timeout: Duration,
    reconnect_delay: Duration,
    ws: Option<WsStream>,
    committed: HashMap<String, u64>,
    stats: LiveStats,
}

impl LiveTradeSource {
    /// The connection is opened lazily by the first `poll`.
    pub fn new(instruments: Vec<String>, config: &LiveConfig) -> Self {
        Self {
            url: config.ws_url.clone(),
            instruments,
            recv_timeout: Duration::from_millis(config.recv_timeout_ms),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            ws: None,
            committed: HashMap::new(),
            stats: LiveStats::default(),
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> &LiveStats {
        &self.stats
    }

    /// Last committed venue trade id for `instrument_id`.
    #[cfg(test)]
    pub fn committed_trade_id(&self, instrument_id: &str) -> Option<u64> {
        self.committed.get(instrument_id).copied()
    }

    fn drop_connection(&mut self) {
        self.ws = None;
        let stats = &self.stats;
        info!(
            trades = stats.trades,
            control_messages = stats.control_messages,
            malformed_messages = stats.malformed_messages,
            invalid_trades = stats.invalid_trades,
            connects = stats.connects,
            "trade WebSocket dropped"
        );
    }

    async fn connect(&mut self) -> Result<()> {
        info!(url = %self.url, instruments = ?self.instruments, "connecting to trade WebSocket");

        let (mut ws, _response) = connect_async(&self.url)
            .await
            .context("failed to connect to trade WebSocket")?;

        ws.send(Message::Text(subscribe_request(&self.instruments)))
            .await
            .context("failed to send trade subscription")?;

        self.stats.connects += 1;
        info!(instruments = ?self.instruments, "subscribed to trade channel");
        self.ws = Some(ws);
        Ok(())
    }

    /// Turn one text frame into validated trades. Never fails: anything that
    /// cannot be used is counted, logged and skipped.
    fn decode_text(&mut self, text: &str) -> Vec<SourcedTrade> {
        match parse_feed_message(text) {
            Ok(FeedMessage::Trades(raw)) => raw
                .into_iter()
                .filter_map(|t| self.validate(t))
                .collect(),
            Ok(FeedMessage::Control(kind)) => {
                self.stats.control_messages += 1;
                debug!(kind = %kind, "control message skipped");
                Vec::new()
            }
            Ok(FeedMessage::Rejected(reason)) => {
                self.stats.control_messages += 1;
                error!(reason = %reason, "venue rejected request");
                Vec::new()
            }
            Err(e) => {
                self.stats.malformed_messages += 1;
                warn!(error = %e, "dropping malformed trade message");
                Vec::new()
            }
        }
    }

    fn validate(&mut self, raw: WsTrade) -> Option<SourcedTrade> {
        let trade = iso8601_to_ms(&raw.timestamp)
            .and_then(|ts| Trade::new(raw.symbol.clone(), raw.price, raw.qty, ts));
        match trade {
            Ok(trade) => {
                self.stats.trades += 1;
                Some(SourcedTrade {
                    cursor: SourceCursor::Live {
                        instrument_id: raw.symbol,
                        trade_id: raw.trade_id,
                    },
                    trade,
                })
            }
            Err(e) => {
                self.stats.invalid_trades += 1;
                warn!(instrument = %raw.symbol, trade_id = raw.trade_id, error = %e, "dropping invalid trade");
                None
            }
        }
    }
}

#[async_trait]
impl TradeSource for LiveTradeSource {
    async fn poll(&mut self) -> Result<Vec<SourcedTrade>> {
        if self.ws.is_none() {
            if let Err(e) = self.connect().await {
                error!(error = %e, delay_ms = self.reconnect_delay.as_millis() as u64, "trade WebSocket connect failed, retrying");
                tokio::time::sleep(self.reconnect_delay).await;
                return Ok(Vec::new());
            }
        }
        let Some(ws) = self.ws.as_mut() else {
            return Ok(Vec::new());
        };

        let received = tokio::time::timeout(self.recv_timeout, ws.next()).await;
        match received {
            Err(_elapsed) => Ok(Vec::new()),
            Ok(Some(Ok(Message::Text(text)))) => Ok(self.decode_text(&text)),
            Ok(Some(Ok(Message::Close(frame)))) => {
                warn!(frame = ?frame, "trade WebSocket closed by venue");
                self.drop_connection();
                Ok(Vec::new())
            }
            // Ping / Pong / Binary: tungstenite answers pings itself.
            Ok(Some(Ok(_))) => Ok(Vec::new()),
            Ok(Some(Err(e))) => {
                error!(error = %e, "trade WebSocket read error, will reconnect");
                self.drop_connection();
                Ok(Vec::new())
            }
            Ok(None) => {
                warn!("trade WebSocket stream ended, will reconnect");
                self.drop_connection();
                Ok(Vec::new())
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        false
    }

    async fn commit(&mut self, cursors: &[SourceCursor]) -> Result<()> {
        for cursor in cursors {
            if let SourceCursor::Live {
                instrument_id,
                trade_id,
            } = cursor
            {
                let entry = self.committed.entry(instrument_id.clone()).or_insert(*trade_id);
                if *trade_id > *entry {
                    *entry = *trade_id;
                }
                debug!(instrument = %instrument_id, high_water = *entry, "live cursor committed");
            }
        }
        Ok(())
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Live
    }
}

// =============================================================================
// Tests
// =============================================================================
