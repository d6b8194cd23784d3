// =============================================================================
// Rate-Limit Tracker — per-instrument backoff for the public REST API
// =============================================================================
//
// Kraken answers an over-eager client with `EGeneral:Too many requests`
// instead of data. The response is retryable: the caller sleeps a fixed
// backoff and asks for the same page again. An instrument that keeps getting
// throttled is eventually given up on so the backfill as a whole terminates.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

/// What the caller should do after a rate-limited response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitVerdict {
    /// Sleep, then retry the same page.
    Backoff(Duration),
    /// Stop fetching this instrument.
    GiveUp,
}

/// Counts consecutive rate-limited responses per instrument.
pub struct RateLimitTracker {
    backoff: Duration,
    max_consecutive: u32,
    consecutive: HashMap<String, u32>,
    total: u64,
}

impl RateLimitTracker {
    pub fn new(backoff: Duration, max_consecutive: u32) -> Self {
        Self {
            backoff,
            max_consecutive,
            consecutive: HashMap::new(),
            total: 0,
        }
    }

    /// Register a rate-limited response for `instrument_id`.
    pub fn record_limited(&mut self, instrument_id: &str) -> RateLimitVerdict {
        self.total += 1;
        let hits = self.consecutive.entry(instrument_id.to_string()).or_insert(0);
        *hits += 1;

        if *hits >= self.max_consecutive {
            warn!(
                instrument = %instrument_id,
                consecutive = *hits,
                limit = self.max_consecutive,
                "rate limit hit repeatedly, giving up on instrument"
            );
            return RateLimitVerdict::GiveUp;
        }

        warn!(
            instrument = %instrument_id,
            consecutive = *hits,
            total = self.total,
            backoff_ms = self.backoff.as_millis() as u64,
            "too many requests, backing off"
        );
        RateLimitVerdict::Backoff(self.backoff)
    }

    /// A page came back with data; the throttle streak is over.
    pub fn record_success(&mut self, instrument_id: &str) {
        if let Some(hits) = self.consecutive.remove(instrument_id) {
            debug!(instrument = %instrument_id, previous_hits = hits, "rate-limit streak cleared");
        }
    }

    #[cfg(test)]
    pub fn consecutive_hits(&self, instrument_id: &str) -> u32 {
        self.consecutive.get(instrument_id).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub fn total_hits(&self) -> u64 {
        self.total
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("backoff", &self.backoff)
            .field("max_consecutive", &self.max_consecutive)
            .field("total", &self.total)
            .finish()
    }
}
