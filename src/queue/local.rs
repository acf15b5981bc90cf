//! Local queue backend.
//!
//! Keeps the whole `QueueState` behind one async mutex, so every operation
//! is atomic for all tasks of the process. With a state file configured,
//! each mutation is applied to a staged copy, persisted, and only then
//! swapped in; a failed write leaves the queue as it was.
//!
//! ## Storage Layout
//!
//! ```text
//! {state_file}          # Full queue state (JSON)
//! {state_file}.tmp      # Write buffer, synced then renamed over the state file
//! {state_file}.lock     # Exclusive lock held while the queue is open
//! ```
//!
//! Only one process may open a state file. Roles running as separate
//! processes share the `sqlite` backend instead.
//!
//! Ids found claimed when the file is opened belonged to a process that
//! died mid-item; they go back to the front of pending.

use std::ffi::OsString;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};

use crate::error::{AppError, Result};
use crate::models::{Counter, ItemId, PassRecord, PipelineStats, QueueConfig, RetryRecord};
use crate::queue::{Horizons, QueueState, WorkQueue};

/// Single-process queue backend, optionally durable.
pub struct LocalQueue {
    state: Mutex<QueueState>,
    pending_ready: Notify,
    missing_ready: Notify,
    horizons: Horizons,
    state_file: Option<PathBuf>,
    // Released when the queue is dropped or the process dies
    _lock: Option<File>,
}

impl LocalQueue {
    /// Volatile queue, lost on exit.
    pub fn in_memory(horizons: Horizons) -> Self {
        Self::from_state(QueueState::new(), horizons, None, None)
    }

    /// Open (or create) a durable queue backed by `path`.
    ///
    /// Fails if another queue already holds the file open.
    pub async fn open(path: impl Into<PathBuf>, horizons: Horizons) -> Result<Self> {
        let path = path.into();
        ensure_dir(&path)
            .await
            .map_err(|e| AppError::queue(format!("create {}: {e}", path.display())))?;
        let lock = lock_exclusive(&sibling(&path, "lock"))?;

        let mut state = match read_bytes(&path).await? {
            Some(bytes) => serde_json::from_slice::<QueueState>(&bytes)
                .map_err(|e| AppError::queue(format!("corrupt state file {}: {e}", path.display())))?,
            None => QueueState::new(),
        };
        state.rebuild_indexes();

        let recovered = state.recover_claimed();
        if recovered > 0 {
            log::warn!(
                "Recovered {} claimed ids from {} back to pending",
                recovered,
                path.display()
            );
        }

        write_state(&path, &state).await?;
        Ok(Self::from_state(state, horizons, Some(path), Some(lock)))
    }

    /// Build a local queue from the `[queue]` config section.
    pub async fn from_config(config: &QueueConfig) -> Result<Self> {
        let horizons = Horizons::from_config(config);
        match &config.state_file {
            Some(path) => Self::open(path, horizons).await,
            None => Ok(Self::in_memory(horizons)),
        }
    }

    fn from_state(
        state: QueueState,
        horizons: Horizons,
        state_file: Option<PathBuf>,
        lock: Option<File>,
    ) -> Self {
        Self {
            state: Mutex::new(state),
            pending_ready: Notify::new(),
            missing_ready: Notify::new(),
            horizons,
            state_file,
            _lock: lock,
        }
    }

    /// Run a mutation under the lock and persist the result.
    async fn mutate<T>(&self, f: impl FnOnce(&mut QueueState) -> T) -> Result<T> {
        let mut state = self.state.lock().await;
        self.commit(&mut state, f).await
    }

    /// Apply `f` to a staged copy, persist it, then swap it in.
    async fn commit<T>(&self, state: &mut QueueState, f: impl FnOnce(&mut QueueState) -> T) -> Result<T> {
        let Some(path) = &self.state_file else {
            return Ok(f(state));
        };
        let mut staged = state.clone();
        let out = f(&mut staged);
        write_state(path, &staged).await?;
        *state = staged;
        Ok(out)
    }

    async fn read<T>(&self, f: impl FnOnce(&QueueState) -> T) -> T {
        let state = self.state.lock().await;
        f(&state)
    }

    /// Blocking pop shared by both channels.
    async fn pop_from(
        &self,
        ready: &Notify,
        timeout: Duration,
        has_items: fn(&QueueState) -> bool,
        take: fn(&mut QueueState) -> Option<ItemId>,
    ) -> Result<Option<ItemId>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = ready.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent push cannot be missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if has_items(&state) {
                    return self.commit(&mut state, take).await;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[async_trait]
impl WorkQueue for LocalQueue {
    async fn enqueue_if_new(&self, ids: &[ItemId]) -> Result<usize> {
        let horizons = self.horizons;
        let added = self
            .mutate(|s| s.enqueue_if_new(ids, Utc::now(), horizons))
            .await?;
        if added > 0 {
            self.pending_ready.notify_waiters();
        }
        Ok(added)
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<ItemId>> {
        self.pop_from(&self.pending_ready, timeout, QueueState::has_pending, QueueState::pop)
            .await
    }

    async fn release(&self, id: &str) -> Result<bool> {
        let released = self.mutate(|s| s.release(id)).await?;
        if released {
            self.pending_ready.notify_waiters();
        }
        Ok(released)
    }

    async fn is_processed(&self, id: &str) -> Result<bool> {
        Ok(self.read(|s| s.is_processed(id)).await)
    }

    async fn mark_processed(&self, id: &str) -> Result<()> {
        self.mutate(|s| {
            s.mark_processed(id);
        })
        .await
    }

    async fn store_snapshot(&self, id: &str, hash: &str, at: DateTime<Utc>) -> Result<()> {
        self.mutate(|s| s.store_snapshot(id, hash, at)).await
    }

    async fn has_changed(&self, id: &str, hash: &str) -> Result<bool> {
        Ok(self.read(|s| s.has_changed(id, hash)).await)
    }

    async fn requeue_with_retry(&self, id: &str, max_attempts: u32, error: &str) -> Result<bool> {
        let requeued = self
            .mutate(|s| s.requeue_with_retry(id, max_attempts, error))
            .await?;
        if requeued {
            self.pending_ready.notify_waiters();
        }
        Ok(requeued)
    }

    async fn retry_record(&self, id: &str) -> Result<Option<RetryRecord>> {
        Ok(self.read(|s| s.retry_record(id).cloned()).await)
    }

    async fn mark_not_found(&self, id: &str) -> Result<()> {
        self.mutate(|s| {
            s.mark_not_found(id);
        })
        .await
    }

    async fn push_missing(&self, ids: &[ItemId]) -> Result<usize> {
        let added = self.mutate(|s| s.push_missing(ids)).await?;
        if added > 0 {
            self.missing_ready.notify_waiters();
        }
        Ok(added)
    }

    async fn pop_missing(&self, timeout: Duration) -> Result<Option<ItemId>> {
        self.pop_from(
            &self.missing_ready,
            timeout,
            QueueState::has_missing,
            QueueState::pop_missing,
        )
        .await
    }

    async fn mark_verified_inactive(&self, id: &str) -> Result<bool> {
        self.mutate(|s| s.mark_verified_inactive(id, Utc::now())).await
    }

    async fn update_last_seen(&self, id: &str) -> Result<()> {
        self.mutate(|s| s.update_last_seen(id, Utc::now())).await
    }

    async fn find_stale(&self, threshold: chrono::Duration) -> Result<Vec<ItemId>> {
        Ok(self.read(|s| s.find_stale(threshold, Utc::now())).await)
    }

    async fn incr(&self, counter: Counter) -> Result<()> {
        self.mutate(|s| s.bump(counter)).await
    }

    async fn stats(&self) -> Result<PipelineStats> {
        Ok(self.read(QueueState::stats).await)
    }

    async fn record_pass(&self, record: PassRecord) -> Result<()> {
        self.mutate(|s| s.record_pass(record)).await
    }

    async fn last_pass(&self) -> Result<Option<PassRecord>> {
        Ok(self.read(|s| s.last_pass().cloned()).await)
    }

    async fn close(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            if let Some(path) = &self.state_file {
                write_state(path, &state).await?;
            }
        }
        // Wake blocked pollers so they observe shutdown promptly
        self.pending_ready.notify_waiters();
        self.missing_ready.notify_waiters();
        Ok(())
    }
}

/// `{path}.{suffix}`, keeping the full file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Take a non-blocking exclusive lock on `path`, creating it if needed.
fn lock_exclusive(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| AppError::queue(format!("open {}: {e}", path.display())))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(AppError::queue(format!(
            "{} is held by another process",
            path.display()
        ))),
        Err(TryLockError::Error(e)) => Err(AppError::queue(format!("lock {}: {e}", path.display()))),
    }
}

async fn write_state(path: &Path, state: &QueueState) -> Result<()> {
    let bytes = serde_json::to_vec(state)?;
    write_bytes(path, &bytes)
        .await
        .map_err(|e| AppError::queue(format!("persist {}: {e}", path.display())))
}

/// Ensure parent directory exists.
async fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Write bytes atomically (write to temp, sync, then rename).
async fn write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    ensure_dir(path).await?;

    let tmp = sibling(path, "tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}

/// Read bytes, returning None if file doesn't exist.
async fn read_bytes(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::queue(format!("read {}: {e}", path.display()))),
    }
}
