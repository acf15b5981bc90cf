//! Work queue: the single source of truth shared by every pipeline role.
//!
//! The queue owns id membership (pending, claimed, missing, processed,
//! inactive), change-detection snapshots, retry bookkeeping and counters.
//! Each trait method is atomic from the caller's point of view.
//!
//! Logical outcomes (duplicates, exhausted retries, empty channels) are
//! returned as values. `Err` is reserved for backing-store trouble
//! (`AppError::Queue`), which callers treat as retryable.
//!
//! Backends:
//! - `LocalQueue`: one process, optional JSON state file
//! - `SqliteQueue`: one database shared by every coordinator, worker and
//!   verifier process, with leased claims

pub mod local;
pub mod sqlite;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    Counter, ItemId, PassRecord, PipelineStats, QueueBackend, QueueConfig, RetryRecord,
};

pub use local::LocalQueue;
pub use sqlite::SqliteQueue;
pub use state::{Horizons, QueueState};

/// Open the backend selected by the `[queue]` config section.
pub async fn open(config: &QueueConfig) -> Result<Arc<dyn WorkQueue>> {
    match config.backend {
        QueueBackend::Local => {
            match &config.state_file {
                Some(path) => log::info!("Queue state: {}", path.display()),
                None => log::warn!("No queue.state_file configured, queue is in-memory only"),
            }
            Ok(Arc::new(LocalQueue::from_config(config).await?))
        }
        QueueBackend::Sqlite => Ok(Arc::new(SqliteQueue::from_config(config).await?)),
    }
}

/// Operations every queue backend provides.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append ids not already known; returns the number actually added.
    async fn enqueue_if_new(&self, ids: &[ItemId]) -> Result<usize>;

    /// Claim the next pending id, waiting at most `timeout`.
    ///
    /// `Ok(None)` means the channel stayed empty.
    async fn pop(&self, timeout: Duration) -> Result<Option<ItemId>>;

    /// Give a claimed id back to the front of pending without counting an
    /// attempt. `false` if the id was not claimed.
    async fn release(&self, id: &str) -> Result<bool>;

    async fn is_processed(&self, id: &str) -> Result<bool>;

    async fn mark_processed(&self, id: &str) -> Result<()>;

    async fn store_snapshot(&self, id: &str, hash: &str, at: DateTime<Utc>) -> Result<()>;

    /// Compare against the stored snapshot; no snapshot means changed.
    async fn has_changed(&self, id: &str, hash: &str) -> Result<bool>;

    /// Count a failed attempt. `true` if re-queued, `false` once `max_attempts`
    /// is reached and the id has been dropped as permanently failed.
    async fn requeue_with_retry(&self, id: &str, max_attempts: u32, error: &str) -> Result<bool>;

    async fn retry_record(&self, id: &str) -> Result<Option<RetryRecord>>;

    /// Release a claimed id the source reported gone, without retrying it.
    async fn mark_not_found(&self, id: &str) -> Result<()>;

    /// Queue ids for authoritative re-check; returns the number added.
    async fn push_missing(&self, ids: &[ItemId]) -> Result<usize>;

    async fn pop_missing(&self, timeout: Duration) -> Result<Option<ItemId>>;

    /// `true` the first time the id is marked.
    async fn mark_verified_inactive(&self, id: &str) -> Result<bool>;

    async fn update_last_seen(&self, id: &str) -> Result<()>;

    /// Processed ids not seen within `threshold` and not verified inactive.
    async fn find_stale(&self, threshold: chrono::Duration) -> Result<Vec<ItemId>>;

    async fn incr(&self, counter: Counter) -> Result<()>;

    async fn stats(&self) -> Result<PipelineStats>;

    /// Store the drop guard baseline after a discovery pass.
    async fn record_pass(&self, record: PassRecord) -> Result<()>;

    async fn last_pass(&self) -> Result<Option<PassRecord>>;

    /// Persist and release backend resources.
    async fn close(&self) -> Result<()>;
}
