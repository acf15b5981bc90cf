//! Pipeline counters exposed for observability.

use serde::{Deserialize, Serialize};

/// Counters that pipeline roles bump explicitly.
///
/// Counters the queue maintains on its own (queued, processed, permanently
/// failed, ...) are not listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Changed,
    Unchanged,
    RestoredActive,
}

/// Aggregate counters plus current queue gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Ids observed by discovery, duplicates included
    pub discovered: u64,
    /// Ids actually appended to pending after dedup
    pub queued: u64,
    pub processed: u64,
    pub changed: u64,
    pub unchanged: u64,
    /// Items dropped because the detail fetch said they are gone
    pub not_found: u64,
    /// Retries scheduled
    pub retried: u64,
    pub permanently_failed: u64,
    pub missing_candidates: u64,
    pub verified_inactive: u64,
    pub restored_active: u64,

    #[serde(default)]
    pub gauges: QueueGauges,
}

/// Point-in-time sizes of the queue's sets and channels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueGauges {
    pub pending: usize,
    pub claimed: usize,
    pub missing: usize,
    pub processed_total: usize,
    /// Currently verified inactive; restoring an item lowers this
    pub inactive_total: usize,
}

impl PipelineStats {
    pub fn bump(&mut self, counter: Counter) {
        match counter {
            Counter::Changed => self.changed += 1,
            Counter::Unchanged => self.unchanged += 1,
            Counter::RestoredActive => self.restored_active += 1,
        }
    }

    /// Key/value pairs for log summaries.
    pub fn summary_items(&self) -> Vec<(&'static str, String)> {
        vec![
            ("discovered", self.discovered.to_string()),
            ("queued", self.queued.to_string()),
            ("processed", self.processed.to_string()),
            ("changed", self.changed.to_string()),
            ("unchanged", self.unchanged.to_string()),
            ("not found", self.not_found.to_string()),
            ("retried", self.retried.to_string()),
            ("permanently failed", self.permanently_failed.to_string()),
            ("missing candidates", self.missing_candidates.to_string()),
            ("verified inactive", self.verified_inactive.to_string()),
            ("restored active", self.restored_active.to_string()),
            ("pending", self.gauges.pending.to_string()),
            ("claimed", self.gauges.claimed.to_string()),
            ("missing", self.gauges.missing.to_string()),
        ]
    }
}
