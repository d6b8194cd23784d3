// =============================================================================
// Log Trade Source — trades replayed from a partitioned log topic
// =============================================================================
//
// Consumes JSON trade messages from the trades topic as a member of a consumer
// group. Auto-commit is off: offsets move only when the driver commits the
// cursors of trades whose records are durably written, so a crash replays
// everything after the last commit.
//
//   - receive timeout     => empty batch
//   - undecodable message => warning + empty batch (its offset is passed over
//                            by the next commit on that partition)
//   - consumer error      => poll error; the driver backs off
// =============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;
use crate::source::{SourcedTrade, TradeSource};
use crate::types::{SourceCursor, SourceMode, Trade};

/// Wire shape of a trade message. Field names follow `Trade`; the aliases
/// accept producers that key trades by product and plain `timestamp`.
#[derive(Debug, Deserialize)]
struct TradeMessage {
    #[serde(alias = "product_id")]
    instrument_id: String,
    price: f64,
    volume: f64,
    #[serde(alias = "timestamp")]
    timestamp_ms: i64,
}

/// Decode and validate one message payload.
pub fn decode_trade(payload: &[u8]) -> Result<Trade> {
    let msg: TradeMessage =
        serde_json::from_slice(payload).context("trade message is not valid JSON")?;
    Trade::new(msg.instrument_id, msg.price, msg.volume, msg.timestamp_ms)
}

/// Next offset to consume per (topic, partition), from acknowledged cursors.
pub fn next_offsets(cursors: &[SourceCursor]) -> BTreeMap<(String, i32), i64> {
    let mut next: BTreeMap<(String, i32), i64> = BTreeMap::new();
    for cursor in cursors {
        if let SourceCursor::Log {
            topic,
            partition,
            offset,
        } = cursor
        {
            let entry = next.entry((topic.clone(), *partition)).or_insert(offset + 1);
            if offset + 1 > *entry {
                *entry = offset + 1;
            }
        }
    }
    next
}

pub struct LogTradeSource {
    consumer: StreamConsumer,
    topic: String,
    mode: SourceMode,
    recv_timeout: Duration,
    decoded: u64,
    rejected: u64,
}

impl LogTradeSource {
    /// Join the consumer group and subscribe. The broker is contacted lazily.
    pub fn new(config: &KafkaConfig, mode: SourceMode) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.broker_address)
            .set("group.id", &config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .create()
            .with_context(|| format!("failed to create consumer for {}", config.broker_address))?;
        consumer
            .subscribe(&[config.trades_topic.as_str()])
            .with_context(|| format!("failed to subscribe to {}", config.trades_topic))?;

        info!(
            broker = %config.broker_address,
            topic = %config.trades_topic,
            group = %config.consumer_group,
            offset_reset = %config.auto_offset_reset,
            "consuming trades from log"
        );
        Ok(Self {
            consumer,
            topic: config.trades_topic.clone(),
            mode,
            recv_timeout: Duration::from_millis(config.recv_timeout_ms),
            decoded: 0,
            rejected: 0,
        })
    }
}

#[async_trait]
impl TradeSource for LogTradeSource {
    async fn poll(&mut self) -> Result<Vec<SourcedTrade>> {
        let received = tokio::time::timeout(self.recv_timeout, self.consumer.recv()).await;
        let message = match received {
            Err(_elapsed) => return Ok(Vec::new()),
            Ok(Err(e)) => {
                return Err(e).with_context(|| format!("failed to receive from {}", self.topic))
            }
            Ok(Ok(message)) => message.detach(),
        };

        let cursor = SourceCursor::Log {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };
        match message.payload().map(decode_trade) {
            Some(Ok(trade)) => {
                self.decoded += 1;
                Ok(vec![SourcedTrade { trade, cursor }])
            }
            Some(Err(e)) => {
                self.rejected += 1;
                warn!(?cursor, rejected = self.rejected, error = %format!("{e:#}"), "dropping undecodable trade message");
                Ok(Vec::new())
            }
            None => {
                self.rejected += 1;
                warn!(?cursor, rejected = self.rejected, "dropping empty trade message");
                Ok(Vec::new())
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        false
    }

    async fn commit(&mut self, cursors: &[SourceCursor]) -> Result<()> {
        let next = next_offsets(cursors);
        if next.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), offset) in &next {
            tpl.add_partition_offset(topic, *partition, Offset::Offset(*offset))
                .with_context(|| format!("bad commit offset {offset} for {topic}/{partition}"))?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .context("failed to commit consumer offsets")?;

        debug!(?next, decoded = self.decoded, "log offsets committed");
        Ok(())
    }

    fn mode(&self) -> SourceMode {
        self.mode
    }
}

// =============================================================================
// Tests
// =============================================================================
