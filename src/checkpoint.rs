// =============================================================================
// Backfill Checkpoint — committed progress per instrument
// =============================================================================
//
// The historical source writes the highest committed trade timestamp per
// instrument here after every successful sink flush, and reads it back on
// start-up to resume a backfill instead of starting over.
//
// Persistence uses an atomic tmp + rename so a crash mid-write never leaves a
// truncated file behind.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    instruments: BTreeMap<String, i64>,
    #[serde(default)]
    updated_at: Option<String>,
}

/// File-backed map of instrument -> last committed timestamp (ms).
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: CheckpointFile,
    dirty: bool,
}

impl CheckpointStore {
    /// Open the checkpoint at `path`. A missing file is an empty checkpoint.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read checkpoint from {}", path.display()))?;
            let state: CheckpointFile = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse checkpoint from {}", path.display()))?;
            info!(
                path = %path.display(),
                instruments = state.instruments.len(),
                "backfill checkpoint loaded"
            );
            state
        } else {
            CheckpointFile::default()
        };

        Ok(Self {
            path,
            state,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn committed_ms(&self, instrument_id: &str) -> Option<i64> {
        self.state.instruments.get(instrument_id).copied()
    }

    /// Raise the committed timestamp for `instrument_id`. Never moves backwards.
    pub fn record(&mut self, instrument_id: &str, timestamp_ms: i64) {
        let entry = self
            .state
            .instruments
            .entry(instrument_id.to_string())
            .or_insert(timestamp_ms);
        if timestamp_ms > *entry {
            *entry = timestamp_ms;
        }
        self.dirty = true;
    }

    /// Persist pending changes, if any.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.state.updated_at = Some(Utc::now().to_rfc3339());

        let content = serde_json::to_string_pretty(&self.state)
            .context("failed to serialise checkpoint to JSON")?;

        let tmp_path = self.path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp checkpoint to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp checkpoint to {}", self.path.display()))?;

        self.dirty = false;
        debug!(path = %self.path.display(), "backfill checkpoint saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("cp.json")).unwrap();
        assert_eq!(store.committed_ms("XBT/USD"), None);
    }

    #[test]
    fn record_is_monotonic_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");

        let mut store = CheckpointStore::open(&path).unwrap();
        store.record("XBT/USD", 5_000);
        store.record("XBT/USD", 3_000);
        store.record("ETH/USD", 7_000);
        store.save().unwrap();
        assert_eq!(store.committed_ms("XBT/USD"), Some(5_000));

        let reopened = CheckpointStore::open(&path).unwrap();
        assert_eq!(reopened.committed_ms("XBT/USD"), Some(5_000));
        assert_eq!(reopened.committed_ms("ETH/USD"), Some(7_000));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(CheckpointStore::open(&path).is_err());
    }
}
