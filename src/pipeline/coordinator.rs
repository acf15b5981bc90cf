//! Discovery coordinator.
//!
//! Pages through every partition's search surface, streams observed ids
//! into the queue page by page and, once the pass is complete, flags items
//! unseen for `missing_threshold` as missing candidates.
//!
//! ## Partition termination
//!
//! A partition ends at the first empty page, at a page that only repeats
//! ids already seen in this partition, after persistent page failures, or
//! at `max_pages`. Advertised totals are logged but never trusted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;

use crate::error::Result;
use crate::models::{Config, CoordinatorConfig, ItemId, Partition, PassRecord, RetryPolicy};
use crate::pipeline::drop_guard::{DropGuard, DropGuardConfig};
use crate::pipeline::with_timeout;
use crate::queue::WorkQueue;
use crate::services::{SearchPage, SearchSource};
use crate::utils::log;

/// Settings of a discovery pass.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub partitions: Vec<Partition>,
    pub limits: CoordinatorConfig,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            partitions: config.partitions.clone(),
            limits: config.coordinator.clone(),
            retry: config.retry.clone(),
            call_timeout: config.http.timeout(),
        }
    }
}

/// Result of crawling one partition.
#[derive(Debug, Clone, Default)]
struct PartitionReport {
    pages: u32,
    ids: HashSet<ItemId>,
    queued: usize,
    failed: bool,
}

/// Summary of a discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Distinct ids observed across all partitions
    pub observed: usize,
    /// Ids newly added to pending
    pub queued: usize,
    pub failed_partitions: Vec<Partition>,
    /// Ids pushed to the missing channel
    pub missing: usize,
    /// Missing detection was skipped (drop guard or shutdown)
    pub missing_skipped: bool,
    pub interrupted: bool,
}

pub struct Coordinator {
    queue: Arc<dyn WorkQueue>,
    search: Arc<dyn SearchSource>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        search: Arc<dyn SearchSource>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            queue,
            search,
            settings,
        }
    }

    /// Run one full discovery pass.
    ///
    /// `Err` only for queue transport errors; failed partitions are logged
    /// and reported.
    pub async fn run_pass(&self, run_id: &str, shutdown: watch::Receiver<bool>) -> Result<PassReport> {
        let limits = &self.settings.limits;
        ::log::info!(
            "[{run_id}] Discovery pass over {} partitions ({} at a time)",
            self.settings.partitions.len(),
            limits.max_concurrent_partitions
        );

        let mut partition_stream = stream::iter(self.settings.partitions.iter())
            .map(|partition| {
                let shutdown = shutdown.clone();
                async move {
                    let result = self.crawl_partition(run_id, partition, &shutdown).await;
                    (partition, result)
                }
            })
            .buffer_unordered(limits.max_concurrent_partitions.max(1));

        let mut report = PassReport::default();
        let mut observed: HashSet<ItemId> = HashSet::new();
        while let Some((partition, result)) = partition_stream.next().await {
            let partition_report = result?;
            ::log::info!(
                "[{run_id}] {partition}: {} ids over {} pages, {} queued",
                partition_report.ids.len(),
                partition_report.pages,
                partition_report.queued
            );
            if partition_report.failed {
                report.failed_partitions.push(partition.clone());
            }
            report.queued += partition_report.queued;
            observed.extend(partition_report.ids);
        }
        report.observed = observed.len();
        report.interrupted = *shutdown.borrow();

        if report.interrupted {
            ::log::warn!("[{run_id}] Pass interrupted, skipping missing detection");
            report.missing_skipped = true;
        } else {
            self.detect_missing(run_id, &mut report).await?;
        }

        let stats = self.queue.stats().await?;
        log::stats(&format!("{run_id} discovery pass"), &stats);
        Ok(report)
    }

    async fn detect_missing(&self, run_id: &str, report: &mut PassReport) -> Result<()> {
        let limits = &self.settings.limits;
        let guard = DropGuard::with_config(DropGuardConfig {
            max_drop_percent: limits.max_drop_percent,
            min_baseline: limits.min_baseline,
            confirm_passes: limits.confirm_passes,
        });
        let baseline = self.queue.last_pass().await?;

        if !guard.evaluate(run_id, report.observed, baseline.as_ref().map(|p| p.observed)) {
            report.missing_skipped = true;
            let Some(baseline) = baseline else {
                return Ok(());
            };
            if report.observed == 0 || !report.failed_partitions.is_empty() {
                ::log::info!("[{run_id}] Incomplete pass, not counted towards a new baseline");
                return Ok(());
            }

            let held_passes = guard.hold(&baseline, report.observed);
            if !guard.is_confirmed(held_passes) {
                ::log::info!(
                    "[{run_id}] Lower count held back ({held_passes}/{} consistent passes)",
                    limits.confirm_passes
                );
                self.queue
                    .record_pass(PassRecord {
                        held_passes,
                        held_observed: report.observed,
                        ..baseline
                    })
                    .await?;
                return Ok(());
            }

            ::log::warn!(
                "[{run_id}] {held_passes} consistent passes near {} ids, accepting as the new baseline (was {})",
                report.observed,
                baseline.observed
            );
            report.missing_skipped = false;
        }

        let stale = self.queue.find_stale(limits.missing_threshold()).await?;
        report.missing = self.queue.push_missing(&stale).await?;
        self.queue
            .record_pass(PassRecord::accepted(report.observed, Utc::now()))
            .await?;
        ::log::info!(
            "[{run_id}] {} stale items, {} flagged for verification",
            stale.len(),
            report.missing
        );
        Ok(())
    }

    async fn crawl_partition(
        &self,
        run_id: &str,
        partition: &Partition,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<PartitionReport> {
        let max_pages = self.settings.limits.max_pages;
        let mut report = PartitionReport::default();

        for page in 1..=max_pages {
            if *shutdown.borrow() {
                break;
            }

            let search_page = match self.fetch_page(run_id, partition, page).await {
                Ok(search_page) => search_page,
                Err(e) => {
                    ::log::error!(
                        "[{run_id}] {partition}: page {page} failed after {} attempts, skipping partition: {e}",
                        self.settings.retry.page_retries + 1
                    );
                    report.failed = true;
                    break;
                }
            };

            if page == 1 && search_page.total == Some(0) {
                ::log::info!("[{run_id}] {partition}: source reports zero items");
            }
            if search_page.ids.is_empty() {
                break;
            }

            let fresh: Vec<ItemId> = search_page
                .ids
                .into_iter()
                .filter(|id| report.ids.insert(id.clone()))
                .collect();
            if fresh.is_empty() {
                ::log::debug!("[{run_id}] {partition}: page {page} repeats earlier ids, stopping");
                break;
            }

            report.queued += self.queue.enqueue_if_new(&fresh).await?;
            report.pages = page;

            if page == max_pages {
                ::log::warn!("[{run_id}] {partition}: stopped at the {max_pages}-page safety bound");
            }
        }

        Ok(report)
    }

    /// Fetch one page, retrying `page_retries` times with backoff.
    async fn fetch_page(&self, run_id: &str, partition: &Partition, page: u32) -> Result<SearchPage> {
        let retry = &self.settings.retry;
        let mut attempt = 1;
        loop {
            let result = with_timeout(
                self.settings.call_timeout,
                format!("search {partition} page {page}"),
                self.search.search_page(partition, page),
            )
            .await;

            match result {
                Ok(search_page) => return Ok(search_page),
                Err(e) if attempt > retry.page_retries => return Err(e),
                Err(e) => {
                    let delay = retry.backoff(attempt);
                    ::log::warn!(
                        "[{run_id}] {partition}: page {page} attempt {attempt} failed, retrying in {delay:?}: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
