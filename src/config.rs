// =============================================================================
// Pipeline Configuration — built once at startup, passed by reference
// =============================================================================
//
// Every tunable lives here. All fields carry serde defaults so a partial JSON
// file (or no file at all) still yields a runnable configuration. Environment
// variables override the file for the handful of settings that differ between
// deployments.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::sink::feature_store::FeatureGroup;
use crate::types::{SourceMode, WriteMode};

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_instruments() -> Vec<String> {
    vec!["BTC/USD".to_string(), "ETH/USD".to_string()]
}

fn default_window_duration_ms() -> u64 {
    60_000
}

fn default_max_batch_size() -> usize {
    100
}

fn default_max_flush_interval_ms() -> u64 {
    10_000
}

fn default_poll_error_backoff_ms() -> u64 {
    5_000
}

fn default_flush_retry_delay_ms() -> u64 {
    1_000
}

fn default_ws_url() -> String {
    "wss://ws.kraken.com/v2".to_string()
}

fn default_recv_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_rest_url() -> String {
    "https://api.kraken.com".to_string()
}

fn default_last_n_days() -> u32 {
    1
}

fn default_page_delay_ms() -> u64 {
    1_000
}

fn default_rate_limit_backoff_ms() -> u64 {
    30_000
}

fn default_max_rate_limit_retries() -> u32 {
    5
}

fn default_broker_address() -> String {
    "localhost:19092".to_string()
}

fn default_trades_topic() -> String {
    "trades".to_string()
}

fn default_candles_topic() -> String {
    "ohlc".to_string()
}

fn default_consumer_group() -> String {
    "trade_to_ohlc".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_log_recv_timeout_ms() -> u64 {
    1_000
}

fn default_message_timeout_ms() -> u64 {
    5_000
}

fn default_jsonl_dir() -> PathBuf {
    PathBuf::from("feature_store")
}

fn default_trade_group() -> FeatureGroup {
    FeatureGroup::new("trades", 1)
}

fn default_candle_group() -> FeatureGroup {
    FeatureGroup::new("ohlc_feature_group", 1)
}

// =============================================================================
// LiveConfig
// =============================================================================

/// Streaming venue connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Upper bound on a single blocking receive. A timeout yields an empty
    /// poll so the driver can run its flush timer.
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            recv_timeout_ms: default_recv_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

// =============================================================================
// BackfillConfig
// =============================================================================

/// Historical backfill settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// Explicit range start. When either bound is missing the range is
    /// derived from `last_n_days`.
    #[serde(default)]
    pub from_ms: Option<i64>,

    #[serde(default)]
    pub to_ms: Option<i64>,

    /// Number of whole UTC days ending at today's midnight.
    #[serde(default = "default_last_n_days")]
    pub last_n_days: u32,

    /// Pause between successful page requests.
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    /// Fixed sleep after a rate-limited response.
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,

    /// Consecutive rate-limited responses after which an instrument is
    /// abandoned and declared done.
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,

    /// Where committed backfill progress is persisted. `None` disables resume.
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            from_ms: None,
            to_ms: None,
            last_n_days: default_last_n_days(),
            page_delay_ms: default_page_delay_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            checkpoint_path: None,
        }
    }
}

impl BackfillConfig {
    /// Resolve the `[from_ms, to_ms)` range to fetch.
    pub fn resolve_range(&self, now: DateTime<Utc>) -> (i64, i64) {
        if let (Some(from), Some(to)) = (self.from_ms, self.to_ms) {
            return (from, to);
        }
        let midnight = now.date_naive().and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        let to_ms = midnight.unwrap_or(now).timestamp_millis();
        let from_ms = to_ms - i64::from(self.last_n_days) * MS_PER_DAY;
        (from_ms, to_ms)
    }
}

// =============================================================================
// KafkaConfig
// =============================================================================

/// Which kind of upstream feeds the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// The exchange itself: websocket when live, REST when historical.
    #[default]
    Venue,
    /// Trade messages already on a partitioned log topic.
    Log,
}

impl std::str::FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "venue" => Ok(Self::Venue),
            "log" | "kafka" => Ok(Self::Log),
            other => bail!("invalid source kind '{other}', expected 'venue' or 'log'"),
        }
    }
}

/// Partitioned-log settings, shared by the log source and the log-backed
/// feature store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_broker_address")]
    pub broker_address: String,

    /// JSON trade messages, keyed by instrument.
    #[serde(default = "default_trades_topic")]
    pub trades_topic: String,

    /// JSON candle messages, keyed by instrument.
    #[serde(default = "default_candles_topic")]
    pub candles_topic: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Where a consumer group with no committed offset starts.
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,

    #[serde(default = "default_log_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// Producer delivery timeout per message.
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            broker_address: default_broker_address(),
            trades_topic: default_trades_topic(),
            candles_topic: default_candles_topic(),
            consumer_group: default_consumer_group(),
            auto_offset_reset: default_auto_offset_reset(),
            recv_timeout_ms: default_log_recv_timeout_ms(),
            message_timeout_ms: default_message_timeout_ms(),
        }
    }
}

// =============================================================================
// RoutingConfig
// =============================================================================

/// Which records flow to the sink, and where they land.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Buffer every raw trade for the trade feature group.
    #[serde(default = "default_true")]
    pub persist_trades: bool,

    /// Feed trades to the OHLC aggregator and buffer finalized candles.
    #[serde(default = "default_true")]
    pub aggregate_candles: bool,

    /// Override for the destination tag. Defaults from the source mode.
    #[serde(default)]
    pub destination: Option<WriteMode>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            persist_trades: true,
            aggregate_candles: true,
            destination: None,
        }
    }
}

// =============================================================================
// FeatureStoreConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FeatureStoreBackend {
    /// Append rows to local JSON-lines files.
    Jsonl {
        #[serde(default = "default_jsonl_dir")]
        dir: PathBuf,
    },
    /// POST rows to an HTTP feature-store endpoint.
    Http {
        base_url: String,
        #[serde(default)]
        api_key: Option<String>,
    },
    /// Produce rows as JSON messages to the log topics in `kafka`.
    Kafka,
}

impl Default for FeatureStoreBackend {
    fn default() -> Self {
        Self::Jsonl {
            dir: default_jsonl_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStoreConfig {
    #[serde(default)]
    pub backend: FeatureStoreBackend,

    #[serde(default = "default_trade_group")]
    pub trade_group: FeatureGroup,

    #[serde(default = "default_candle_group")]
    pub candle_group: FeatureGroup,
}

impl Default for FeatureStoreConfig {
    fn default() -> Self {
        Self {
            backend: FeatureStoreBackend::default(),
            trade_group: default_trade_group(),
            candle_group: default_candle_group(),
        }
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for one pipeline process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: SourceMode,

    #[serde(default)]
    pub source: SourceKind,

    #[serde(default = "default_instruments")]
    pub instruments: Vec<String>,

    /// Tumbling window size for candles.
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,

    /// Flush as soon as this many entries are buffered.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Flush a non-empty buffer at least this often, however sparse the input.
    #[serde(default = "default_max_flush_interval_ms")]
    pub max_flush_interval_ms: u64,

    /// Sleep after a source poll error before polling again.
    #[serde(default = "default_poll_error_backoff_ms")]
    pub poll_error_backoff_ms: u64,

    /// Sleep between forced-flush attempts while draining.
    #[serde(default = "default_flush_retry_delay_ms")]
    pub flush_retry_delay_ms: u64,

    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub feature_store: FeatureStoreConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: SourceMode::default(),
            source: SourceKind::default(),
            instruments: default_instruments(),
            window_duration_ms: default_window_duration_ms(),
            max_batch_size: default_max_batch_size(),
            max_flush_interval_ms: default_max_flush_interval_ms(),
            poll_error_backoff_ms: default_poll_error_backoff_ms(),
            flush_retry_delay_ms: default_flush_retry_delay_ms(),
            live: LiveConfig::default(),
            backfill: BackfillConfig::default(),
            kafka: KafkaConfig::default(),
            routing: RoutingConfig::default(),
            feature_store: FeatureStoreConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            instruments = ?config.instruments,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("PIPELINE_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(kind) = lookup("PIPELINE_SOURCE") {
            self.source = kind.parse()?;
        }
        if let Some(list) = lookup("PIPELINE_INSTRUMENTS") {
            self.instruments = list
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        for key in ["OHLC_WINDOW_SECS", "PIPELINE_WINDOW_SECS"] {
            if let Some(secs) = lookup(key) {
                let secs: u64 = secs
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} is not an integer: {secs}"))?;
                self.window_duration_ms = secs.saturating_mul(1000);
            }
        }
        if let Some(days) = lookup("PIPELINE_LAST_N_DAYS") {
            self.backfill.last_n_days = days
                .trim()
                .parse()
                .with_context(|| format!("PIPELINE_LAST_N_DAYS is not an integer: {days}"))?;
        }
        if let Some(broker) = lookup("KAFKA_BROKER_ADDRESS") {
            self.kafka.broker_address = broker;
        }
        if let Some(group) = lookup("KAFKA_CONSUMER_GROUP") {
            self.kafka.consumer_group = group;
        }
        if let Some(name) = lookup("FEATURE_GROUP_NAME") {
            self.feature_store.candle_group.name = name;
        }
        if let Some(version) = lookup("FEATURE_GROUP_VERSION") {
            self.feature_store.candle_group.version = version
                .trim()
                .parse()
                .with_context(|| format!("FEATURE_GROUP_VERSION is not an integer: {version}"))?;
        }
        if let Some(base_url) = lookup("FEATURE_STORE_URL") {
            self.feature_store.backend = FeatureStoreBackend::Http {
                base_url,
                api_key: lookup("FEATURE_STORE_API_KEY"),
            };
        }
        Ok(())
    }

    /// Reject settings under which the pipeline cannot make progress.
    pub fn validate(&self) -> Result<()> {
        match self.source {
            SourceKind::Venue if self.instruments.is_empty() => bail!("no instruments configured"),
            SourceKind::Log if self.kafka.trades_topic.is_empty() => {
                bail!("log source needs a trades topic")
            }
            SourceKind::Log if self.kafka.consumer_group.is_empty() => {
                bail!("log source needs a consumer group")
            }
            _ => {}
        }
        if !matches!(self.kafka.auto_offset_reset.as_str(), "earliest" | "latest") {
            bail!(
                "kafka.auto_offset_reset must be 'earliest' or 'latest', got '{}'",
                self.kafka.auto_offset_reset
            );
        }
        if self.window_duration_ms == 0 {
            bail!("window_duration_ms must be positive");
        }
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be positive");
        }
        if self.max_flush_interval_ms == 0 {
            bail!("max_flush_interval_ms must be positive");
        }
        if !self.routing.persist_trades && !self.routing.aggregate_candles {
            bail!("routing disables both raw trades and candles; nothing would be written");
        }
        Ok(())
    }

    /// Destination tag applied to every buffered record.
    pub fn destination(&self) -> WriteMode {
        self.routing
            .destination
            .unwrap_or_else(|| self.mode.default_destination())
    }
}
