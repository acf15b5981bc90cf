//! Missing-candidate verifier.
//!
//! A single discovery miss is not evidence of removal. The verifier asks
//! the source directly and only deactivates on a definitive not-found;
//! ambiguous or failed checks leave the item active.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{Counter, FetchOutcome, ItemId};
use crate::pipeline::runner::PollTask;
use crate::pipeline::worker::WorkerSettings;
use crate::pipeline::{outcome_or_transient, with_timeout};
use crate::queue::WorkQueue;
use crate::services::{ExistenceChecker, Sink};

const INACTIVE_REASON: &str = "not found at source";

/// Outcome of verifying one missing candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    RestoredActive,
    MarkedInactive,
    /// Ambiguous or failed check; re-flagged by a later pass if still stale
    AssumedActive,
    /// Sink refused the deactivation; re-flagged by a later pass
    SinkFailed,
}

pub struct Verifier {
    queue: Arc<dyn WorkQueue>,
    checker: Arc<dyn ExistenceChecker>,
    sink: Arc<dyn Sink>,
    settings: WorkerSettings,
}

impl Verifier {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        checker: Arc<dyn ExistenceChecker>,
        sink: Arc<dyn Sink>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            checker,
            sink,
            settings,
        }
    }

    pub async fn verify(&self, run_id: &str, id: &str) -> Result<Verdict> {
        let checked = with_timeout(
            self.settings.call_timeout,
            format!("check {id}"),
            self.checker.check(id),
        )
        .await;

        match outcome_or_transient(checked) {
            FetchOutcome::Found(_) => {
                self.queue.update_last_seen(id).await?;
                self.queue.incr(Counter::RestoredActive).await?;
                log::info!("[{run_id}] {id} still listed, restored");
                Ok(Verdict::RestoredActive)
            }
            FetchOutcome::NotFound => {
                let marked = with_timeout(
                    self.settings.call_timeout,
                    format!("mark inactive {id}"),
                    self.sink.mark_inactive(
                        &self.settings.catalog,
                        id,
                        &self.settings.country,
                        INACTIVE_REASON,
                    ),
                )
                .await;
                if let Err(e) = marked {
                    log::warn!("[{run_id}] {id} could not be marked inactive: {e}");
                    return Ok(Verdict::SinkFailed);
                }

                self.queue.mark_verified_inactive(id).await?;
                log::info!("[{run_id}] {id} verified inactive");
                Ok(Verdict::MarkedInactive)
            }
            FetchOutcome::Ambiguous(reason) | FetchOutcome::Transient(reason) => {
                log::info!("[{run_id}] {id} check inconclusive, assuming active: {reason}");
                Ok(Verdict::AssumedActive)
            }
        }
    }
}

#[async_trait]
impl PollTask for Verifier {
    fn queue(&self) -> &dyn WorkQueue {
        self.queue.as_ref()
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<ItemId>> {
        self.queue.pop_missing(timeout).await
    }

    async fn handle(&self, run_id: &str, id: &str) -> Result<()> {
        self.verify(run_id, id).await?;
        tokio::time::sleep(self.settings.rate_limit.delay()).await;
        Ok(())
    }

    /// Put the candidate back on the missing channel for another check.
    async fn release(&self, id: &str) -> Result<()> {
        self.queue.push_missing(&[id.to_string()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{RateLimit, RetryPolicy};
    use crate::queue::{Horizons, LocalQueue};
    use crate::services::fakes::{RecordingSink, ScriptedSource, found};

    fn settings() -> WorkerSettings {
        WorkerSettings {
            catalog: "idealista-es".to_string(),
            country: "es".to_string(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimit {
                base_delay_ms: 0,
                jitter_ratio: 0.0,
            },
            call_timeout: Duration::from_millis(200),
        }
    }

    async fn stale_queue(id: &str) -> Arc<LocalQueue> {
        let queue = Arc::new(LocalQueue::in_memory(Horizons::default()));
        queue
            .store_snapshot(id, "h", Utc::now() - chrono::Duration::days(3))
            .await
            .unwrap();
        queue.mark_processed(id).await.unwrap();
        queue.push_missing(&[id.to_string()]).await.unwrap();
        queue
    }

    fn verifier(queue: &Arc<LocalQueue>, source: ScriptedSource, sink: &Arc<RecordingSink>) -> Verifier {
        Verifier::new(queue.clone(), Arc::new(source), sink.clone(), settings())
    }

    #[tokio::test]
    async fn test_ambiguous_never_deactivates() {
        let queue = stale_queue("5").await;
        let sink = Arc::new(RecordingSink::new());
        let v = verifier(
            &queue,
            ScriptedSource::new().script("5", vec![FetchOutcome::Ambiguous("HTTP 403".into())]),
            &sink,
        );

        let id = queue.pop_missing(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(v.verify("v", &id).await.unwrap(), Verdict::AssumedActive);
        assert!(sink.inactive_ids().is_empty());
        assert!(queue.is_processed("5").await.unwrap());

        // Still stale, so the next pass flags it again
        let stale = queue.find_stale(chrono::Duration::hours(48)).await.unwrap();
        assert_eq!(stale, vec!["5"]);
    }

    #[tokio::test]
    async fn test_sink_failure_leaves_item_for_next_pass() {
        let queue = stale_queue("6").await;
        let sink = Arc::new(RecordingSink::new().failing_inactive(1));
        let v = verifier(&queue, ScriptedSource::new(), &sink);

        let id = queue.pop_missing(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(v.verify("v", &id).await.unwrap(), Verdict::SinkFailed);
        assert_eq!(queue.stats().await.unwrap().verified_inactive, 0);
        assert_eq!(
            queue.find_stale(chrono::Duration::hours(48)).await.unwrap(),
            vec!["6"]
        );
    }

    #[tokio::test]
    async fn test_found_restores_inactive_item() {
        let queue = stale_queue("8").await;
        queue.mark_verified_inactive("8").await.unwrap();
        queue.push_missing(&["8".to_string()]).await.unwrap();
        let sink = Arc::new(RecordingSink::new());
        let v = verifier(&queue, ScriptedSource::new().script("8", vec![found("8", 1)]), &sink);

        assert_eq!(v.verify("v", "8").await.unwrap(), Verdict::RestoredActive);
        assert!(queue.is_processed("8").await.unwrap());
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.restored_active, 1);
        assert_eq!(stats.gauges.inactive_total, 0);
    }

    #[tokio::test]
    async fn test_release_puts_candidate_back_on_missing() {
        let queue = stale_queue("9").await;
        let sink = Arc::new(RecordingSink::new());
        let v = verifier(&queue, ScriptedSource::new(), &sink);

        let id = queue.pop_missing(Duration::from_millis(10)).await.unwrap().unwrap();
        v.release(&id).await.unwrap();

        let again = queue.pop_missing(Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.as_deref(), Some("9"));
    }
}
