//! Shared poll loop for the worker and verifier pools.
//!
//! A loop polls its channel, hands each id to the task and stops when
//! shutdown is signalled or, in batch mode, after `max_idle_polls`
//! consecutive empty polls. Queue transport errors pause the loop with the
//! shared backoff policy; every other failure is handled per id by the task.
//! A claimed id whose `handle` returned `Err` is released back to its
//! channel once the pause is over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::models::{ItemId, RetryPolicy, RunConfig};
use crate::queue::WorkQueue;
use crate::utils::log;

/// Stop condition of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Exit after this many consecutive empty polls
    Batch { max_idle_polls: u32 },
    /// Run until shutdown is signalled
    Daemon,
}

impl RunMode {
    pub fn from_config(config: &RunConfig) -> Self {
        if config.daemon {
            Self::Daemon
        } else {
            Self::Batch {
                max_idle_polls: config.max_idle_polls.max(1),
            }
        }
    }
}

/// One role driven by the poll loop.
#[async_trait]
pub trait PollTask: Send + Sync {
    fn queue(&self) -> &dyn WorkQueue;

    /// Claim the next id of this task's channel.
    async fn poll(&self, timeout: Duration) -> Result<Option<ItemId>>;

    /// Process one claimed id. `Err` is reserved for queue transport errors.
    async fn handle(&self, run_id: &str, id: &str) -> Result<()>;

    /// Return an id whose `handle` failed to this task's channel.
    async fn release(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

/// Loop settings shared by every loop of a pool.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub mode: RunMode,
    pub pop_timeout: Duration,
    /// Backoff applied on queue transport errors
    pub backoff: RetryPolicy,
    /// Log counters every N handled items (0 disables)
    pub stats_every: u64,
}

/// What a pool did before stopping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub handled: u64,
    pub transport_errors: u64,
    /// Handles that failed with something other than a transport error
    pub failed: u64,
}

/// Create a watch channel used to request shutdown.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves once shutdown has been requested.
///
/// A dropped sender never resolves, so loops fall back to their idle limit.
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `concurrency` loops of `task` named `{run_id}-{n}` until they stop.
pub async fn run_pool<T: PollTask>(
    task: &T,
    run_id: &str,
    concurrency: usize,
    settings: &LoopSettings,
    shutdown: watch::Receiver<bool>,
) -> RunReport {
    let handled = AtomicU64::new(0);
    let loops = (1..=concurrency.max(1)).map(|n| {
        let loop_id = if concurrency > 1 {
            format!("{run_id}-{n}")
        } else {
            run_id.to_string()
        };
        let shutdown = shutdown.clone();
        let handled = &handled;
        async move { run_loop(task, &loop_id, settings, shutdown, handled).await }
    });

    let reports = futures::future::join_all(loops).await;
    let report = reports.into_iter().fold(RunReport::default(), |acc, r| RunReport {
        handled: acc.handled + r.handled,
        transport_errors: acc.transport_errors + r.transport_errors,
        failed: acc.failed + r.failed,
    });

    match task.queue().stats().await {
        Ok(stats) => log::stats(&format!("{run_id} finished"), &stats),
        Err(e) => ::log::warn!("[{run_id}] Could not read counters: {e}"),
    }
    report
}

async fn run_loop<T: PollTask>(
    task: &T,
    run_id: &str,
    settings: &LoopSettings,
    mut shutdown: watch::Receiver<bool>,
    pool_handled: &AtomicU64,
) -> RunReport {
    let mut report = RunReport::default();
    let mut idle_polls = 0u32;
    let mut consecutive_errors = 0u32;

    ::log::info!("[{run_id}] Started ({:?})", settings.mode);

    loop {
        if *shutdown.borrow() {
            ::log::info!("[{run_id}] Shutdown requested, stopping");
            break;
        }

        let polled = tokio::select! {
            polled = task.poll(settings.pop_timeout) => polled,
            _ = cancelled(&mut shutdown) => continue,
        };

        let (claimed, outcome) = match polled {
            Ok(Some(id)) => {
                idle_polls = 0;
                let handled = task.handle(run_id, &id).await;
                if handled.is_ok() {
                    report.handled += 1;
                    let total = pool_handled.fetch_add(1, Ordering::Relaxed) + 1;
                    if settings.stats_every > 0 && total % settings.stats_every == 0 {
                        if let Ok(stats) = task.queue().stats().await {
                            log::stats(&format!("{run_id} progress"), &stats);
                        }
                    }
                }
                (Some(id), handled)
            }
            Ok(None) => {
                idle_polls += 1;
                if let RunMode::Batch { max_idle_polls } = settings.mode {
                    if idle_polls >= max_idle_polls {
                        ::log::info!("[{run_id}] Idle after {idle_polls} empty polls, exiting");
                        break;
                    }
                }
                (None, Ok(()))
            }
            Err(e) => (None, Err(e)),
        };

        let Err(e) = outcome else {
            consecutive_errors = 0;
            continue;
        };

        consecutive_errors += 1;
        let delay = settings.backoff.backoff(consecutive_errors);
        if e.is_queue_transport() {
            report.transport_errors += 1;
            ::log::warn!(
                "[{run_id}] Queue unavailable ({consecutive_errors} in a row), retrying in {delay:?}: {e}"
            );
        } else {
            report.failed += 1;
            ::log::error!(
                "[{run_id}] Handling {} failed, pausing {delay:?}: {e}",
                claimed.as_deref().unwrap_or("poll")
            );
        }
        // A claim is handed back even when shutdown cut the pause short
        pause(delay, &mut shutdown).await;
        if let Some(id) = claimed {
            report.transport_errors += release_claim(task, run_id, &id, settings, &mut shutdown).await;
        }
    }

    report
}

/// Sleep for `delay`; `true` if shutdown was requested first.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = cancelled(shutdown) => true,
    }
}

/// Keep trying to release `id` until it succeeds or shutdown is requested.
///
/// Returns the number of transport errors seen on the way. A claim left
/// behind at shutdown is recovered when the queue is next opened or its
/// lease runs out.
async fn release_claim<T: PollTask>(
    task: &T,
    run_id: &str,
    id: &str,
    settings: &LoopSettings,
    shutdown: &mut watch::Receiver<bool>,
) -> u64 {
    let mut errors = 0u32;
    loop {
        match task.release(id).await {
            Ok(()) => {
                ::log::debug!("[{run_id}] Released {id}");
                return errors.into();
            }
            Err(e) => {
                errors += 1;
                let delay = settings.backoff.backoff(errors);
                ::log::warn!("[{run_id}] Could not release {id}, retrying in {delay:?}: {e}");
                if pause(delay, shutdown).await {
                    ::log::warn!("[{run_id}] Shutdown with {id} still claimed");
                    return errors.into();
                }
            }
        }
    }
}
