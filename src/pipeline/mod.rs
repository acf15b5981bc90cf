//! Pipeline roles built on the work queue.
//!
//! - `Coordinator`: discovery passes and missing detection
//! - `Worker`: detail fetch, change detection and ingestion
//! - `Verifier`: authoritative re-check of missing candidates
//!
//! Worker and verifier pools share the poll loop in `runner`.

pub mod coordinator;
pub mod drop_guard;
pub mod retry;
pub mod runner;
pub mod verifier;
pub mod worker;

#[cfg(test)]
mod scenarios;

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::FetchOutcome;

pub use coordinator::{Coordinator, CoordinatorSettings, PassReport};
pub use drop_guard::{DropGuard, DropGuardConfig, DropVerdict};
pub use runner::{LoopSettings, PollTask, RunMode, RunReport, run_pool, shutdown_channel};
pub use verifier::{Verdict, Verifier};
pub use worker::{ItemOutcome, Worker, WorkerSettings};

/// Bound a collaborator call by `limit`.
pub(crate) async fn with_timeout<T>(
    limit: Duration,
    what: impl Into<String>,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout(limit, what.into())),
    }
}

/// Fold a failed or timed out fetch into the outcome taxonomy.
pub(crate) fn outcome_or_transient(result: Result<FetchOutcome>) -> FetchOutcome {
    result.unwrap_or_else(|e| FetchOutcome::Transient(e.to_string()))
}
