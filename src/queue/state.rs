//! In-memory queue state and its transition rules.
//!
//! Every method here is synchronous and takes `now` explicitly; the async
//! backends wrap one `QueueState` behind a lock so each call is atomic.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    Counter, ItemId, PassRecord, PipelineStats, QueueConfig, QueueGauges, RetryRecord, Snapshot,
};

/// Dedup windows applied by `enqueue_if_new`.
#[derive(Debug, Clone, Copy)]
pub struct Horizons {
    /// Processed ids fetched more recently than this are not re-queued
    pub dedup: Duration,
    /// Verified-inactive ids marked more recently than this are ignored
    pub inactive: Duration,
}

impl Horizons {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            dedup: config.dedup_horizon(),
            inactive: config.inactive_horizon(),
        }
    }
}

impl Default for Horizons {
    fn default() -> Self {
        Self {
            dedup: Duration::hours(24),
            inactive: Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueState {
    pending: VecDeque<ItemId>,
    claimed: HashSet<ItemId>,
    missing: VecDeque<ItemId>,
    processed: HashSet<ItemId>,
    snapshots: HashMap<ItemId, Snapshot>,
    retries: HashMap<ItemId, RetryRecord>,
    inactive: HashMap<ItemId, DateTime<Utc>>,
    stats: PipelineStats,
    last_pass: Option<PassRecord>,

    #[serde(skip)]
    pending_set: HashSet<ItemId>,
    #[serde(skip)]
    missing_set: HashSet<ItemId>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild lookup sets after deserialization.
    pub fn rebuild_indexes(&mut self) {
        self.pending_set = self.pending.iter().cloned().collect();
        self.missing_set = self.missing.iter().cloned().collect();
    }

    /// Return ids left claimed (e.g. by a crashed process) to pending.
    pub fn recover_claimed(&mut self) -> usize {
        let claimed: Vec<ItemId> = self.claimed.drain().collect();
        let mut recovered = 0;
        for id in claimed {
            if self.pending_set.insert(id.clone()) {
                self.pending.push_front(id);
                recovered += 1;
            }
        }
        recovered
    }

    /// Append ids that are not already known; returns how many were added.
    ///
    /// Known ids still get their `last_seen` refreshed.
    pub fn enqueue_if_new(&mut self, ids: &[ItemId], now: DateTime<Utc>, horizons: Horizons) -> usize {
        let mut added = 0;
        self.stats.discovered += ids.len() as u64;

        for id in ids {
            if self.pending_set.contains(id)
                || self.claimed.contains(id)
                || self.missing_set.contains(id)
            {
                self.touch(id, now);
                continue;
            }

            if let Some(marked_at) = self.inactive.get(id) {
                if now - *marked_at < horizons.inactive {
                    continue;
                }
                // Relisted after the inactive horizon
                self.inactive.remove(id);
            }

            if self.processed.contains(id) {
                let fresh = self
                    .snapshots
                    .get(id)
                    .is_some_and(|s| now - s.fetched_at < horizons.dedup);
                self.touch(id, now);
                if fresh {
                    continue;
                }
                self.processed.remove(id);
            }

            self.pending_set.insert(id.clone());
            self.pending.push_back(id.clone());
            added += 1;
        }

        self.stats.queued += added as u64;
        added
    }

    /// Claim the oldest pending id.
    pub fn pop(&mut self) -> Option<ItemId> {
        let id = self.pending.pop_front()?;
        self.pending_set.remove(&id);
        self.claimed.insert(id.clone());
        Some(id)
    }

    /// Return a claimed id to the front of pending without counting an attempt.
    pub fn release(&mut self, id: &str) -> bool {
        if !self.claimed.remove(id) {
            return false;
        }
        if self.pending_set.insert(id.to_string()) {
            self.pending.push_front(id.to_string());
        }
        true
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_missing(&self) -> bool {
        !self.missing.is_empty()
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.processed.contains(id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending_set.contains(id)
    }

    pub fn is_claimed(&self, id: &str) -> bool {
        self.claimed.contains(id)
    }

    pub fn is_missing(&self, id: &str) -> bool {
        self.missing_set.contains(id)
    }

    pub fn is_inactive(&self, id: &str) -> bool {
        self.inactive.contains_key(id)
    }

    pub fn snapshot(&self, id: &str) -> Option<&Snapshot> {
        self.snapshots.get(id)
    }

    pub fn retry_record(&self, id: &str) -> Option<&RetryRecord> {
        self.retries.get(id)
    }

    /// Returns `true` if the id entered the processed set.
    ///
    /// A successful fetch proves the item exists, so any inactive mark is cleared.
    pub fn mark_processed(&mut self, id: &str) -> bool {
        self.claimed.remove(id);
        self.retries.remove(id);
        self.inactive.remove(id);
        if self.processed.insert(id.to_string()) {
            self.stats.processed += 1;
            true
        } else {
            false
        }
    }

    pub fn store_snapshot(&mut self, id: &str, hash: &str, at: DateTime<Utc>) {
        match self.snapshots.get_mut(id) {
            Some(snapshot) => {
                snapshot.hash = hash.to_string();
                snapshot.fetched_at = at;
                snapshot.last_seen = snapshot.last_seen.max(at);
            }
            None => {
                self.snapshots.insert(id.to_string(), Snapshot::new(hash, at));
            }
        }
    }

    /// A missing snapshot counts as changed.
    pub fn has_changed(&self, id: &str, hash: &str) -> bool {
        self.snapshots.get(id).is_none_or(|s| s.hash != hash)
    }

    /// Count a failed attempt and either re-queue the id or drop it.
    ///
    /// Only a claimed id is counted. A repeated call for the same attempt
    /// finds it already pending (`true`) or already dropped (`false`).
    pub fn requeue_with_retry(&mut self, id: &str, max_attempts: u32, error: &str) -> bool {
        if !self.claimed.remove(id) {
            return self.pending_set.contains(id);
        }

        let record = self.retries.entry(id.to_string()).or_default();
        record.attempts += 1;
        record.last_error = Some(error.to_string());

        if record.attempts < max_attempts {
            self.pending_set.insert(id.to_string());
            self.pending.push_back(id.to_string());
            self.stats.retried += 1;
            true
        } else {
            self.retries.remove(id);
            self.stats.permanently_failed += 1;
            false
        }
    }

    /// Drop a claimed id the source reported gone. Returns `false` if not claimed.
    pub fn mark_not_found(&mut self, id: &str) -> bool {
        if !self.claimed.remove(id) {
            return false;
        }
        self.retries.remove(id);
        self.stats.not_found += 1;
        true
    }

    pub fn push_missing(&mut self, ids: &[ItemId]) -> usize {
        let mut added = 0;
        for id in ids {
            if self.missing_set.contains(id)
                || self.pending_set.contains(id)
                || self.claimed.contains(id)
                || self.inactive.contains_key(id)
            {
                continue;
            }
            self.missing_set.insert(id.clone());
            self.missing.push_back(id.clone());
            added += 1;
        }
        self.stats.missing_candidates += added as u64;
        added
    }

    pub fn pop_missing(&mut self) -> Option<ItemId> {
        let id = self.missing.pop_front()?;
        self.missing_set.remove(&id);
        Some(id)
    }

    /// Returns `true` the first time an id is marked inactive.
    pub fn mark_verified_inactive(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        self.processed.remove(id);
        if self.inactive.contains_key(id) {
            return false;
        }
        self.inactive.insert(id.to_string(), now);
        self.stats.verified_inactive += 1;
        true
    }

    /// Refresh `last_seen`; an inactive id becomes active again.
    pub fn update_last_seen(&mut self, id: &str, now: DateTime<Utc>) {
        self.touch(id, now);
        if self.inactive.remove(id).is_some()
            && self.snapshots.contains_key(id)
            && !self.pending_set.contains(id)
            && !self.claimed.contains(id)
        {
            self.processed.insert(id.to_string());
        }
    }

    /// Processed, not inactive, not already missing, and unseen since `now - threshold`.
    pub fn find_stale(&self, threshold: Duration, now: DateTime<Utc>) -> Vec<ItemId> {
        let cutoff = now - threshold;
        let mut stale: Vec<ItemId> = self
            .processed
            .iter()
            .filter(|id| !self.inactive.contains_key(*id) && !self.missing_set.contains(*id))
            .filter(|id| self.snapshots.get(*id).is_some_and(|s| s.last_seen < cutoff))
            .cloned()
            .collect();
        stale.sort();
        stale
    }

    pub fn bump(&mut self, counter: Counter) {
        self.stats.bump(counter);
    }

    pub fn record_pass(&mut self, record: PassRecord) {
        self.last_pass = Some(record);
    }

    pub fn last_pass(&self) -> Option<&PassRecord> {
        self.last_pass.as_ref()
    }

    /// Counters plus current gauges.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            gauges: QueueGauges {
                pending: self.pending.len(),
                claimed: self.claimed.len(),
                missing: self.missing.len(),
                processed_total: self.processed.len(),
                inactive_total: self.inactive.len(),
            },
            ..self.stats.clone()
        }
    }

    fn touch(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(snapshot) = self.snapshots.get_mut(id) {
            snapshot.last_seen = snapshot.last_seen.max(now);
        }
    }
}
