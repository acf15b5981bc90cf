//! In-memory collaborators for pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::models::{
    Counter, FetchOutcome, ItemId, NormalizedRecord, Partition, PassRecord, PipelineStats,
    RawPayload, RetryRecord,
};
use crate::queue::{LocalQueue, WorkQueue};
use crate::services::{DetailFetcher, ExistenceChecker, SearchPage, SearchSource, Sink};

/// JSON detail body for `id` that the listing normalizer accepts.
pub fn listing_body(id: &str, price: u32) -> String {
    format!(r#"{{"propertyCode":"{id}","price":{price},"operation":"sale","municipality":"Madrid"}}"#)
}

pub fn found(id: &str, price: u32) -> FetchOutcome {
    FetchOutcome::Found(RawPayload::new(listing_body(id, price)))
}

/// Search surface serving fixed pages per partition.
#[derive(Default)]
pub struct FakeSearch {
    pages: HashMap<Partition, Vec<Vec<ItemId>>>,
    failures: Mutex<HashMap<(Partition, u32), u32>>,
    calls: Mutex<Vec<(Partition, u32)>>,
}

impl FakeSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages(mut self, partition: Partition, pages: Vec<Vec<&str>>) -> Self {
        let pages = pages
            .into_iter()
            .map(|p| p.into_iter().map(str::to_string).collect())
            .collect();
        self.pages.insert(partition, pages);
        self
    }

    /// Fail `page` of `partition` the next `times` calls.
    pub fn failing(self, partition: Partition, page: u32, times: u32) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert((partition, page), times);
        }
        self
    }

    pub fn calls(&self) -> Vec<(Partition, u32)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SearchSource for FakeSearch {
    async fn search_page(&self, partition: &Partition, page: u32) -> Result<SearchPage> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((partition.clone(), page));
        }
        if let Ok(mut failures) = self.failures.lock() {
            if let Some(left) = failures.get_mut(&(partition.clone(), page)) {
                if *left > 0 {
                    *left -= 1;
                    return Err(AppError::fetch(format!("{partition} page {page}"), "HTTP 503"));
                }
            }
        }

        let ids = self
            .pages
            .get(partition)
            .and_then(|pages| pages.get(page as usize - 1))
            .cloned()
            .unwrap_or_default();
        Ok(SearchPage { ids, total: None })
    }
}

/// Fetcher/checker replaying a script of outcomes per id.
///
/// The last outcome of a script repeats; unscripted ids are `NotFound`.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<ItemId, VecDeque<FetchOutcome>>>,
    calls: Mutex<HashMap<ItemId, u32>>,
    delay: Option<Duration>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, id: &str, outcomes: Vec<FetchOutcome>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(id.to_string(), outcomes.into());
        }
        self
    }

    /// Sleep this long before answering.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self, id: &str) -> u32 {
        self.calls
            .lock()
            .ok()
            .and_then(|c| c.get(id).copied())
            .unwrap_or(0)
    }

    async fn next(&self, id: &str) -> FetchOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(id.to_string()).or_default() += 1;
        }
        let Ok(mut scripts) = self.scripts.lock() else {
            return FetchOutcome::Transient("poisoned".to_string());
        };
        match scripts.get_mut(id) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap_or(FetchOutcome::NotFound),
            Some(script) => script.front().cloned().unwrap_or(FetchOutcome::NotFound),
            None => FetchOutcome::NotFound,
        }
    }
}

#[async_trait]
impl DetailFetcher for ScriptedSource {
    async fn fetch(&self, id: &str) -> Result<FetchOutcome> {
        Ok(self.next(id).await)
    }
}

#[async_trait]
impl ExistenceChecker for ScriptedSource {
    async fn check(&self, id: &str) -> Result<FetchOutcome> {
        Ok(self.next(id).await)
    }
}

/// Sink recording every call, optionally failing the first ingests.
#[derive(Default)]
pub struct RecordingSink {
    pub ingested: Mutex<Vec<(ItemId, NormalizedRecord)>>,
    pub inactive: Mutex<Vec<(ItemId, String)>>,
    fail_ingests: AtomicU32,
    fail_inactive: AtomicU32,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_ingests(self, times: u32) -> Self {
        self.fail_ingests.store(times, Ordering::SeqCst);
        self
    }

    pub fn failing_inactive(self, times: u32) -> Self {
        self.fail_inactive.store(times, Ordering::SeqCst);
        self
    }

    pub fn ingested_ids(&self) -> Vec<ItemId> {
        self.ingested
            .lock()
            .map(|v| v.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn inactive_ids(&self) -> Vec<ItemId> {
        self.inactive
            .lock()
            .map(|v| v.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Sink for RecordingSink {
    async fn ingest(
        &self,
        _catalog: &str,
        id: &str,
        _country: &str,
        record: &NormalizedRecord,
        _raw: &RawPayload,
    ) -> Result<()> {
        if take_failure(&self.fail_ingests) {
            return Err(AppError::sink("ingest unavailable"));
        }
        if let Ok(mut ingested) = self.ingested.lock() {
            ingested.push((id.to_string(), record.clone()));
        }
        Ok(())
    }

    async fn mark_inactive(
        &self,
        _catalog: &str,
        id: &str,
        _country: &str,
        reason: &str,
    ) -> Result<()> {
        if take_failure(&self.fail_inactive) {
            return Err(AppError::sink("inactive endpoint unavailable"));
        }
        if let Ok(mut inactive) = self.inactive.lock() {
            inactive.push((id.to_string(), reason.to_string()));
        }
        Ok(())
    }
}

/// Queue whose first `pop` calls fail with a transport error.
pub struct FlakyQueue {
    inner: LocalQueue,
    pop_failures: AtomicU32,
    compare_failures: AtomicU32,
    release_failures: AtomicU32,
}

impl FlakyQueue {
    pub fn new(inner: LocalQueue, pop_failures: u32) -> Self {
        Self {
            inner,
            pop_failures: AtomicU32::new(pop_failures),
            compare_failures: AtomicU32::new(0),
            release_failures: AtomicU32::new(0),
        }
    }

    /// Fail the next `times` snapshot comparisons, after the id was claimed.
    pub fn failing_compares(self, times: u32) -> Self {
        self.compare_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn failing_releases(self, times: u32) -> Self {
        self.release_failures.store(times, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl WorkQueue for FlakyQueue {
    async fn enqueue_if_new(&self, ids: &[ItemId]) -> Result<usize> {
        self.inner.enqueue_if_new(ids).await
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<ItemId>> {
        if take_failure(&self.pop_failures) {
            return Err(AppError::queue("connection refused"));
        }
        self.inner.pop(timeout).await
    }

    async fn release(&self, id: &str) -> Result<bool> {
        if take_failure(&self.release_failures) {
            return Err(AppError::queue("connection reset"));
        }
        self.inner.release(id).await
    }

    async fn is_processed(&self, id: &str) -> Result<bool> {
        self.inner.is_processed(id).await
    }

    async fn mark_processed(&self, id: &str) -> Result<()> {
        self.inner.mark_processed(id).await
    }

    async fn store_snapshot(&self, id: &str, hash: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.store_snapshot(id, hash, at).await
    }

    async fn has_changed(&self, id: &str, hash: &str) -> Result<bool> {
        if take_failure(&self.compare_failures) {
            return Err(AppError::queue("connection reset"));
        }
        self.inner.has_changed(id, hash).await
    }

    async fn requeue_with_retry(&self, id: &str, max_attempts: u32, error: &str) -> Result<bool> {
        self.inner.requeue_with_retry(id, max_attempts, error).await
    }

    async fn retry_record(&self, id: &str) -> Result<Option<RetryRecord>> {
        self.inner.retry_record(id).await
    }

    async fn mark_not_found(&self, id: &str) -> Result<()> {
        self.inner.mark_not_found(id).await
    }

    async fn push_missing(&self, ids: &[ItemId]) -> Result<usize> {
        self.inner.push_missing(ids).await
    }

    async fn pop_missing(&self, timeout: Duration) -> Result<Option<ItemId>> {
        self.inner.pop_missing(timeout).await
    }

    async fn mark_verified_inactive(&self, id: &str) -> Result<bool> {
        self.inner.mark_verified_inactive(id).await
    }

    async fn update_last_seen(&self, id: &str) -> Result<()> {
        self.inner.update_last_seen(id).await
    }

    async fn find_stale(&self, threshold: chrono::Duration) -> Result<Vec<ItemId>> {
        self.inner.find_stale(threshold).await
    }

    async fn incr(&self, counter: Counter) -> Result<()> {
        self.inner.incr(counter).await
    }

    async fn stats(&self) -> Result<PipelineStats> {
        self.inner.stats().await
    }

    async fn record_pass(&self, record: PassRecord) -> Result<()> {
        self.inner.record_pass(record).await
    }

    async fn last_pass(&self) -> Result<Option<PassRecord>> {
        self.inner.last_pass().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
