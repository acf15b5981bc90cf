//! End-to-end runs of the coordinator, worker pool and verifier pool
//! against in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::models::{CoordinatorConfig, FetchOutcome, Partition, RateLimit, RetryPolicy};
use crate::pipeline::{
    Coordinator, CoordinatorSettings, LoopSettings, RunMode, Verifier, Worker, WorkerSettings,
    run_pool, shutdown_channel,
};
use crate::queue::{Horizons, LocalQueue, SqliteQueue, WorkQueue};
use crate::services::ListingNormalizer;
use crate::services::fakes::{FakeSearch, FlakyQueue, RecordingSink, ScriptedSource, found};

fn partition() -> Partition {
    Partition::new("madrid", "sale")
}

fn worker_settings() -> WorkerSettings {
    WorkerSettings {
        catalog: "idealista-es".to_string(),
        country: "es".to_string(),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_ratio: 0.0,
            ..RetryPolicy::default()
        },
        rate_limit: RateLimit {
            base_delay_ms: 1,
            jitter_ratio: 0.5,
        },
        call_timeout: Duration::from_millis(500),
    }
}

fn loop_settings() -> LoopSettings {
    LoopSettings {
        mode: RunMode::Batch { max_idle_polls: 2 },
        pop_timeout: Duration::from_millis(20),
        backoff: worker_settings().retry,
        stats_every: 0,
    }
}

fn coordinator<Q: WorkQueue + 'static>(queue: &Arc<Q>, search: FakeSearch) -> Coordinator {
    Coordinator::new(
        queue.clone(),
        Arc::new(search),
        CoordinatorSettings {
            partitions: vec![partition()],
            limits: CoordinatorConfig::default(),
            retry: worker_settings().retry,
            call_timeout: Duration::from_millis(500),
        },
    )
}

fn worker<Q: WorkQueue + 'static>(
    queue: &Arc<Q>,
    source: &Arc<ScriptedSource>,
    sink: &Arc<RecordingSink>,
) -> Worker {
    Worker::new(
        queue.clone(),
        source.clone(),
        Arc::new(ListingNormalizer::new()),
        sink.clone(),
        worker_settings(),
    )
}

fn verifier(queue: &Arc<LocalQueue>, source: &Arc<ScriptedSource>, sink: &Arc<RecordingSink>) -> Verifier {
    Verifier::new(queue.clone(), source.clone(), sink.clone(), worker_settings())
}

/// Seed an item processed long enough ago to be stale.
async fn seed_stale(queue: &LocalQueue, id: &str) {
    queue
        .store_snapshot(id, "old-hash", Utc::now() - chrono::Duration::days(3))
        .await
        .unwrap();
    queue.mark_processed(id).await.unwrap();
}

#[tokio::test]
async fn test_discovered_ids_processed_once_by_concurrent_workers() {
    let queue = Arc::new(LocalQueue::in_memory(Horizons::default()));
    let source = Arc::new(
        ScriptedSource::new()
            .script("1", vec![found("1", 100)])
            .script("2", vec![found("2", 200)])
            .script("3", vec![found("3", 300)]),
    );
    let sink = Arc::new(RecordingSink::new());

    let (_tx, rx) = shutdown_channel();
    let pass = coordinator(&queue, FakeSearch::new().with_pages(partition(), vec![vec!["1", "2", "3"]]))
        .run_pass("coordinator", rx.clone())
        .await
        .unwrap();
    assert_eq!(pass.queued, 3);

    let worker = worker(&queue, &source, &sink);
    let report = run_pool(&worker, "worker", 2, &loop_settings(), rx).await;
    assert_eq!(report.handled, 3);

    for id in ["1", "2", "3"] {
        assert!(queue.is_processed(id).await.unwrap());
    }
    let mut ingested = sink.ingested_ids();
    ingested.sort();
    assert_eq!(ingested, vec!["1", "2", "3"]);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.changed, 3);
    assert_eq!(stats.gauges.pending, 0);
    assert_eq!(stats.gauges.claimed, 0);
}

#[tokio::test]
async fn test_not_found_is_dropped_without_retry_or_missing() {
    let queue = Arc::new(LocalQueue::in_memory(Horizons::default()));
    let source = Arc::new(ScriptedSource::new().script("42", vec![FetchOutcome::NotFound]));
    let sink = Arc::new(RecordingSink::new());
    queue.enqueue_if_new(&["42".to_string()]).await.unwrap();

    let (_tx, rx) = shutdown_channel();
    let worker = worker(&queue, &source, &sink);
    run_pool(&worker, "worker", 1, &loop_settings(), rx).await;

    assert_eq!(source.calls("42"), 1);
    assert!(!queue.is_processed("42").await.unwrap());
    assert_eq!(queue.pop_missing(Duration::from_millis(10)).await.unwrap(), None);
    assert!(sink.ingested_ids().is_empty());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.not_found, 1);
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.missing_candidates, 0);
}

#[tokio::test]
async fn test_stale_item_found_again_is_restored() {
    let queue = Arc::new(LocalQueue::in_memory(Horizons::default()));
    seed_stale(&queue, "7").await;
    let source = Arc::new(ScriptedSource::new().script("7", vec![found("7", 700)]));
    let sink = Arc::new(RecordingSink::new());

    let (_tx, rx) = shutdown_channel();
    let pass = coordinator(&queue, FakeSearch::new().with_pages(partition(), vec![vec!["1"]]))
        .run_pass("coordinator", rx.clone())
        .await
        .unwrap();
    assert_eq!(pass.missing, 1);

    let verifier = verifier(&queue, &source, &sink);
    let report = run_pool(&verifier, "verifier", 1, &loop_settings(), rx).await;
    assert_eq!(report.handled, 1);

    assert!(sink.inactive_ids().is_empty());
    assert!(queue.is_processed("7").await.unwrap());
    assert!(
        !queue
            .find_stale(chrono::Duration::hours(48))
            .await
            .unwrap()
            .contains(&"7".to_string())
    );
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.restored_active, 1);
    assert_eq!(stats.verified_inactive, 0);
}

#[tokio::test]
async fn test_stale_item_gone_is_marked_inactive_once() {
    let queue = Arc::new(LocalQueue::in_memory(Horizons::default()));
    seed_stale(&queue, "9").await;
    let source = Arc::new(ScriptedSource::new().script("9", vec![FetchOutcome::NotFound]));
    let sink = Arc::new(RecordingSink::new());

    let (_tx, rx) = shutdown_channel();
    let pass = coordinator(&queue, FakeSearch::new())
        .run_pass("coordinator", rx.clone())
        .await
        .unwrap();
    assert_eq!(pass.missing, 1);

    let verifier = verifier(&queue, &source, &sink);
    run_pool(&verifier, "verifier", 2, &loop_settings(), rx.clone()).await;

    assert_eq!(sink.inactive_ids(), vec!["9"]);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.verified_inactive, 1);
    assert_eq!(stats.gauges.inactive_total, 1);
    assert!(
        queue
            .find_stale(chrono::Duration::hours(48))
            .await
            .unwrap()
            .is_empty()
    );

    // A second pass does not flag it again
    let pass = coordinator(&queue, FakeSearch::new())
        .run_pass("coordinator", rx)
        .await
        .unwrap();
    assert_eq!(pass.missing, 0);
    assert_eq!(sink.inactive_ids().len(), 1);
}

#[tokio::test]
async fn test_inactive_item_rediscovered_within_horizon_is_ignored() {
    let queue = Arc::new(LocalQueue::in_memory(Horizons::default()));
    seed_stale(&queue, "9").await;
    queue.mark_verified_inactive("9").await.unwrap();

    assert_eq!(queue.enqueue_if_new(&["9".to_string()]).await.unwrap(), 0);
}

#[tokio::test]
async fn test_durable_queue_survives_between_runs() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("state").join("queue.json");
    let source = Arc::new(ScriptedSource::new().script("1", vec![found("1", 100)]));
    let sink = Arc::new(RecordingSink::new());

    {
        let queue = Arc::new(LocalQueue::open(&path, Horizons::default()).await.unwrap());
        let (_tx, rx) = shutdown_channel();
        coordinator(&queue, FakeSearch::new().with_pages(partition(), vec![vec!["1"]]))
            .run_pass("coordinator", rx.clone())
            .await
            .unwrap();
        let worker = worker(&queue, &source, &sink);
        run_pool(&worker, "worker", 1, &loop_settings(), rx).await;
        queue.close().await.unwrap();
    }

    let queue = LocalQueue::open(&path, Horizons::default()).await.unwrap();
    assert!(queue.is_processed("1").await.unwrap());
    // Rediscovery inside the dedup horizon does not re-queue
    assert_eq!(queue.enqueue_if_new(&["1".to_string()]).await.unwrap(), 0);
    assert_eq!(queue.stats().await.unwrap().changed, 1);
}

#[tokio::test]
async fn test_worker_pool_rides_out_queue_outage() {
    let queue = Arc::new(FlakyQueue::new(LocalQueue::in_memory(Horizons::default()), 3));
    queue.enqueue_if_new(&["5".to_string()]).await.unwrap();
    let source = Arc::new(ScriptedSource::new().script("5", vec![found("5", 500)]));
    let sink = Arc::new(RecordingSink::new());

    let worker = Worker::new(
        queue.clone(),
        source,
        Arc::new(ListingNormalizer::new()),
        sink.clone(),
        worker_settings(),
    );
    let (_tx, rx) = shutdown_channel();
    let report = run_pool(&worker, "worker", 1, &loop_settings(), rx).await;

    assert_eq!(report.transport_errors, 3);
    assert_eq!(report.handled, 1);
    assert_eq!(sink.ingested_ids(), vec!["5"]);
    assert!(queue.is_processed("5").await.unwrap());
}

#[tokio::test]
async fn test_queue_error_mid_item_releases_claim_for_retry() {
    let queue = Arc::new(
        FlakyQueue::new(LocalQueue::in_memory(Horizons::default()), 0)
            .failing_compares(1)
            .failing_releases(1),
    );
    queue.enqueue_if_new(&["5".to_string()]).await.unwrap();
    let source = Arc::new(
        ScriptedSource::new().script("5", vec![found("5", 500), found("5", 500)]),
    );
    let sink = Arc::new(RecordingSink::new());

    let (_tx, rx) = shutdown_channel();
    let report = run_pool(&worker(&queue, &source, &sink), "worker", 1, &loop_settings(), rx).await;

    // One failed comparison plus one failed release
    assert_eq!(report.transport_errors, 2);
    assert_eq!(report.handled, 1);
    assert_eq!(sink.ingested_ids(), vec!["5"]);
    assert!(queue.is_processed("5").await.unwrap());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.gauges.claimed, 0);
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.permanently_failed, 0);
}

#[tokio::test]
async fn test_discovery_and_workers_share_one_database() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("queue.db");
    let lease = Duration::from_secs(60);
    let discovery = Arc::new(SqliteQueue::open(&path, Horizons::default(), lease).await.unwrap());
    let workers = Arc::new(SqliteQueue::open(&path, Horizons::default(), lease).await.unwrap());

    let source = Arc::new(
        ScriptedSource::new()
            .script("1", vec![found("1", 100)])
            .script("2", vec![found("2", 200)]),
    );
    let sink = Arc::new(RecordingSink::new());

    let (_tx, rx) = shutdown_channel();
    let pass = coordinator(&discovery, FakeSearch::new().with_pages(partition(), vec![vec!["1", "2"]]))
        .run_pass("coordinator", rx.clone())
        .await
        .unwrap();
    assert_eq!(pass.queued, 2);

    let report = run_pool(&worker(&workers, &source, &sink), "worker", 2, &loop_settings(), rx).await;
    assert_eq!(report.handled, 2);

    let mut ingested = sink.ingested_ids();
    ingested.sort();
    assert_eq!(ingested, vec!["1", "2"]);
    for id in ["1", "2"] {
        assert!(discovery.is_processed(id).await.unwrap());
    }
    let stats = discovery.stats().await.unwrap();
    assert_eq!(stats.changed, 2);
    assert_eq!(stats.gauges.pending + stats.gauges.claimed, 0);
    // Rediscovery inside the dedup horizon does not re-queue
    assert_eq!(discovery.enqueue_if_new(&["1".to_string(), "2".to_string()]).await.unwrap(), 0);
}
