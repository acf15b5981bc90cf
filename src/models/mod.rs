// src/models/mod.rs

//! Domain models for the re-crawl pipeline.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod item;
mod listing;
mod stats;

// Re-export all public types
pub use config::{
    Config, CoordinatorConfig, HttpConfig, QueueBackend, QueueConfig, RateLimit, RetryPolicy, RunConfig,
    SearchFormat, SinkConfig, SinkKind, SourceConfig,
};
pub use item::{
    FetchOutcome, ItemId, Partition, RawPayload, RetryRecord, Snapshot, content_hash,
};
pub use listing::{ListingPayload, Location, NormalizedRecord, Operation, Price};
pub use stats::{Counter, PipelineStats, QueueGauges};

/// Drop guard baseline kept between discovery passes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PassRecord {
    /// Distinct ids observed by the last accepted pass
    pub observed: usize,
    pub finished_at: chrono::DateTime<chrono::Utc>,

    /// Consecutive later passes the guard held back, each consistent with the previous one
    #[serde(default)]
    pub held_passes: u32,

    /// Size of the most recent held-back pass
    #[serde(default)]
    pub held_observed: usize,
}

impl PassRecord {
    /// A pass accepted as the new baseline.
    pub fn accepted(observed: usize, finished_at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            observed,
            finished_at,
            held_passes: 0,
            held_observed: 0,
        }
    }
}
