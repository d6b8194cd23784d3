// =============================================================================
// Feature Store — the downstream write operation
// =============================================================================
//
// One `write` call carries a whole batch for one feature group and one
// destination. Implementations must be atomic-or-fully-failed per call: the
// sink retries the same rows after any error, so a partially applied write
// is only safe when the store is idempotent per instrument + timestamp.
// =============================================================================

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::config::{FeatureStoreBackend, KafkaConfig, PipelineConfig};
use crate::types::{FeatureRow, WriteMode};

/// A named, versioned feature group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureGroup {
    pub name: String,
    pub version: u32,
}

impl FeatureGroup {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl std::fmt::Display for FeatureGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Write `rows` to `group` in `mode`. Blocking from the caller's point of
    /// view; no partial success.
    async fn write(&self, rows: &[FeatureRow], group: &FeatureGroup, mode: WriteMode) -> Result<()>;

    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;
}

/// Construct the configured backend.
pub fn build_feature_store(config: &PipelineConfig) -> Result<Arc<dyn FeatureStore>> {
    let fs = &config.feature_store;
    match &fs.backend {
        FeatureStoreBackend::Jsonl { dir } => Ok(Arc::new(JsonlFeatureStore::new(dir.clone())?)),
        FeatureStoreBackend::Http { base_url, api_key } => Ok(Arc::new(HttpFeatureStore::new(
            base_url.clone(),
            api_key.clone(),
        )?)),
        FeatureStoreBackend::Kafka => {
            let topics = HashMap::from([
                (fs.trade_group.name.clone(), config.kafka.trades_topic.clone()),
                (fs.candle_group.name.clone(), config.kafka.candles_topic.clone()),
            ]);
            Ok(Arc::new(KafkaFeatureStore::new(&config.kafka, topics)?))
        }
    }
}

// =============================================================================
// JSONL backend
// =============================================================================

/// Appends rows to `<dir>/<group>_v<version>_<mode>.jsonl`.
pub struct JsonlFeatureStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlFeatureStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create feature store dir {}", dir.display()))?;
        info!(dir = %dir.display(), "writing features to JSONL files");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn file_path(&self, group: &FeatureGroup, mode: WriteMode) -> PathBuf {
        self.dir
            .join(format!("{}_v{}_{}.jsonl", group.name, group.version, mode))
    }
}

#[async_trait]
impl FeatureStore for JsonlFeatureStore {
    async fn write(&self, rows: &[FeatureRow], group: &FeatureGroup, mode: WriteMode) -> Result<()> {
        // Serialise everything first so an encoding error writes nothing.
        let mut payload = String::new();
        for row in rows {
            payload.push_str(&serde_json::to_string(row).context("failed to serialise feature row")?);
            payload.push('\n');
        }

        let path = self.file_path(group, mode);
        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(payload.as_bytes())
            .with_context(|| format!("failed to append to {}", path.display()))?;
        file.sync_data()
            .with_context(|| format!("failed to sync {}", path.display()))?;

        debug!(path = %path.display(), rows = rows.len(), "feature rows appended");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}

// =============================================================================
// HTTP backend
// =============================================================================

/// POSTs rows to `<base_url>/feature-groups/<name>/versions/<version>/rows`.
#[derive(Clone)]
pub struct HttpFeatureStore {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpFeatureStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build reqwest client for feature store")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(base_url = %base_url, "writing features over HTTP");
        Ok(Self {
            base_url,
            api_key,
            client,
        })
    }

    pub fn rows_url(&self, group: &FeatureGroup) -> String {
        format!(
            "{}/feature-groups/{}/versions/{}/rows",
            self.base_url, group.name, group.version
        )
    }
}

#[async_trait]
impl FeatureStore for HttpFeatureStore {
    #[instrument(skip(self, rows), fields(rows = rows.len()), name = "feature_store::write")]
    async fn write(&self, rows: &[FeatureRow], group: &FeatureGroup, mode: WriteMode) -> Result<()> {
        let url = self.rows_url(group);
        let mut req = self
            .client
            .post(&url)
            .query(&[("mode", mode.to_string())])
            .json(&json!({ "rows": rows }));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("ApiKey {key}"));
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("POST {url} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("feature store POST {} returned {}: {}", url, status, body);
        }

        debug!(group = %group, mode = %mode, "feature rows accepted");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "HTTP"
    }
}

impl std::fmt::Debug for HttpFeatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFeatureStore")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// =============================================================================
// Kafka backend
// =============================================================================

/// Produces each row as a JSON message keyed by `instrument_id`. The trade
/// group lands on the trades topic and the candle group on the candles topic,
/// so a live venue run with candles off feeds a log-sourced pipeline.
pub struct KafkaFeatureStore {
    producer: FutureProducer,
    /// Feature group name -> topic. Unmapped groups use their own name.
    topics: HashMap<String, String>,
    queue_timeout: Duration,
}

impl KafkaFeatureStore {
    pub fn new(config: &KafkaConfig, topics: HashMap<String, String>) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.broker_address)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .with_context(|| format!("failed to create producer for {}", config.broker_address))?;
        info!(broker = %config.broker_address, ?topics, "writing features to log topics");
        Ok(Self {
            producer,
            topics,
            queue_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }

    pub fn topic_for<'a>(&'a self, group: &'a FeatureGroup) -> &'a str {
        self.topics
            .get(&group.name)
            .map(String::as_str)
            .unwrap_or(group.name.as_str())
    }
}

/// Serialise rows into (key, payload) pairs up front so an encoding error
/// produces nothing.
fn encode_messages(rows: &[FeatureRow]) -> Result<Vec<(String, String)>> {
    rows.iter()
        .map(|row| {
            let key = row
                .get("instrument_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let payload = serde_json::to_string(row).context("failed to serialise feature row")?;
            Ok((key, payload))
        })
        .collect()
}

#[async_trait]
impl FeatureStore for KafkaFeatureStore {
    #[instrument(skip(self, rows), fields(rows = rows.len()), name = "feature_store::produce")]
    async fn write(&self, rows: &[FeatureRow], group: &FeatureGroup, mode: WriteMode) -> Result<()> {
        let topic = self.topic_for(group);
        let messages = encode_messages(rows)?;

        let deliveries = messages.iter().map(|(key, payload)| {
            self.producer.send(
                FutureRecord::to(topic).key(key).payload(payload),
                self.queue_timeout,
            )
        });
        for delivery in futures_util::future::join_all(deliveries).await {
            delivery.map_err(|(e, _)| anyhow!("delivery to topic {topic} failed: {e}"))?;
        }

        debug!(topic, group = %group, mode = %mode, "feature rows produced");
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "Kafka"
    }
}

// =============================================================================
// Tests
// =============================================================================
