//! Detail worker.
//!
//! Turns a claimed id into a forwarded change, a confirmed no-op, a
//! scheduled retry, a permanent failure or a not-found drop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;
use crate::models::{Config, Counter, FetchOutcome, ItemId, RateLimit, RawPayload, RetryPolicy};
use crate::pipeline::runner::PollTask;
use crate::pipeline::{outcome_or_transient, with_timeout};
use crate::queue::WorkQueue;
use crate::services::{DetailFetcher, Normalizer, Sink};

/// Settings a worker needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub catalog: String,
    pub country: String,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimit,
    /// Deadline of every fetch and sink call
    pub call_timeout: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            catalog: config.source.catalog(),
            country: config.source.country.clone(),
            retry: config.retry.clone(),
            rate_limit: config.rate_limit.clone(),
            call_timeout: config.http.timeout(),
        }
    }
}

/// Terminal state of one attempt on one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Another worker already finished this id
    AlreadyProcessed,
    Changed,
    Unchanged,
    NotFound,
    RetryScheduled,
    PermanentlyFailed,
}

pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    fetcher: Arc<dyn DetailFetcher>,
    normalizer: Arc<dyn Normalizer>,
    sink: Arc<dyn Sink>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        fetcher: Arc<dyn DetailFetcher>,
        normalizer: Arc<dyn Normalizer>,
        sink: Arc<dyn Sink>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            fetcher,
            normalizer,
            sink,
            settings,
        }
    }

    /// Process one claimed id.
    ///
    /// Fetch and sink failures are folded into the outcome; only queue
    /// transport errors are returned as `Err`.
    pub async fn process(&self, run_id: &str, id: &str) -> Result<ItemOutcome> {
        if self.queue.is_processed(id).await? {
            // Releases the claim without counting a second time
            self.queue.mark_processed(id).await?;
            log::debug!("[{run_id}] {id} already processed, skipping");
            return Ok(ItemOutcome::AlreadyProcessed);
        }

        let fetched = with_timeout(
            self.settings.call_timeout,
            format!("fetch {id}"),
            self.fetcher.fetch(id),
        )
        .await;

        match outcome_or_transient(fetched) {
            FetchOutcome::Found(payload) => self.apply(run_id, id, payload).await,
            FetchOutcome::NotFound => {
                self.queue.mark_not_found(id).await?;
                log::info!("[{run_id}] {id} not found at source, dropped");
                Ok(ItemOutcome::NotFound)
            }
            FetchOutcome::Ambiguous(reason) => {
                self.fail(run_id, id, &format!("ambiguous: {reason}")).await
            }
            FetchOutcome::Transient(reason) => self.fail(run_id, id, &reason).await,
        }
    }

    async fn apply(&self, run_id: &str, id: &str, payload: RawPayload) -> Result<ItemOutcome> {
        let hash = payload.content_hash();

        if !self.queue.has_changed(id, &hash).await? {
            self.queue.store_snapshot(id, &hash, Utc::now()).await?;
            self.queue.incr(Counter::Unchanged).await?;
            self.queue.mark_processed(id).await?;
            log::debug!("[{run_id}] {id} unchanged");
            return Ok(ItemOutcome::Unchanged);
        }

        let record = match self.normalizer.normalize(id, &payload) {
            Ok(record) => record,
            Err(e) => return self.fail(run_id, id, &e.to_string()).await,
        };

        let ingested = with_timeout(
            self.settings.call_timeout,
            format!("ingest {id}"),
            self.sink.ingest(
                &self.settings.catalog,
                id,
                &self.settings.country,
                &record,
                &payload,
            ),
        )
        .await;
        if let Err(e) = ingested {
            return self.fail(run_id, id, &e.to_string()).await;
        }

        // Snapshot only after the sink accepted the record, so a failed
        // ingest is retried as a change
        self.queue.store_snapshot(id, &hash, Utc::now()).await?;
        self.queue.incr(Counter::Changed).await?;
        self.queue.mark_processed(id).await?;
        log::info!("[{run_id}] {id} changed, ingested");
        Ok(ItemOutcome::Changed)
    }

    /// Back off, then hand the failed attempt to the queue's retry bookkeeping.
    async fn fail(&self, run_id: &str, id: &str, reason: &str) -> Result<ItemOutcome> {
        let policy = &self.settings.retry;
        let attempt = self
            .queue
            .retry_record(id)
            .await?
            .map_or(0, |r| r.attempts)
            + 1;

        if !policy.is_exhausted(attempt) {
            let delay = policy.backoff(attempt);
            log::warn!(
                "[{run_id}] {id} attempt {attempt}/{} failed, retrying in {delay:?}: {reason}",
                policy.max_attempts
            );
            tokio::time::sleep(delay).await;
        }

        if self
            .queue
            .requeue_with_retry(id, policy.max_attempts, reason)
            .await?
        {
            Ok(ItemOutcome::RetryScheduled)
        } else {
            log::error!(
                "[{run_id}] {id} permanently failed after {attempt} attempts, last error: {reason}"
            );
            Ok(ItemOutcome::PermanentlyFailed)
        }
    }
}

#[async_trait]
impl PollTask for Worker {
    fn queue(&self) -> &dyn WorkQueue {
        self.queue.as_ref()
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<ItemId>> {
        self.queue.pop(timeout).await
    }

    async fn handle(&self, run_id: &str, id: &str) -> Result<()> {
        let outcome = self.process(run_id, id).await?;
        if outcome != ItemOutcome::AlreadyProcessed {
            tokio::time::sleep(self.settings.rate_limit.delay()).await;
        }
        Ok(())
    }

    async fn release(&self, id: &str) -> Result<()> {
        if !self.queue.release(id).await? {
            log::debug!("{id} was no longer claimed when released");
        }
        Ok(())
    }
}
