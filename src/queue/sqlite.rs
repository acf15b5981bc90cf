//! SQLite queue backend.
//!
//! One database file shared by every coordinator, worker and verifier
//! process. Membership lives in a single `items` table keyed by id, so an
//! id is in at most one of idle, pending, claimed or processed; the missing
//! channel and the inactive mark are separate columns.
//!
//! Claims carry a lease. A claim whose lease ran out (its process died or
//! hung) is returned to pending by the next pop from any process.
//!
//! Every mutation is one transaction whose first statement takes SQLite's
//! write lock, so read-then-write sequences never race across processes.
//! Blocked pops wake on in-process pushes and otherwise re-check at
//! `POLL_INTERVAL`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tokio::sync::Notify;

use crate::error::{AppError, Result};
use crate::models::{Counter, ItemId, PassRecord, PipelineStats, QueueConfig, QueueGauges, RetryRecord};
use crate::queue::{Horizons, WorkQueue};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const PENDING: &str = "pending";
const CLAIMED: &str = "claimed";
const PROCESSED: &str = "processed";

#[derive(Debug, Clone, Copy)]
enum Channel {
    Pending,
    Missing,
}

/// Multi-process queue backend.
pub struct SqliteQueue {
    pool: SqlitePool,
    horizons: Horizons,
    lease: Duration,
    pending_ready: Notify,
    missing_ready: Notify,
}

impl SqliteQueue {
    /// Open (or create) the database at `path` and apply migrations.
    pub async fn open(path: impl AsRef<Path>, horizons: Horizons, lease: Duration) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::queue(format!("create {}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        log::info!("Queue database: {} (lease {:?})", path.display(), lease);

        Ok(Self {
            pool,
            horizons,
            lease,
            pending_ready: Notify::new(),
            missing_ready: Notify::new(),
        })
    }

    /// Build a SQLite queue from the `[queue]` config section.
    pub async fn from_config(config: &QueueConfig) -> Result<Self> {
        let path = config
            .database
            .as_ref()
            .ok_or_else(|| AppError::config("queue.database is required for the sqlite backend"))?;
        Self::open(path, Horizons::from_config(config), config.lease()).await
    }

    /// Begin a transaction that holds the write lock from its first statement.
    async fn write_tx(&self) -> Result<Transaction<'static, Sqlite>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE meta SET value = value WHERE key = 'writer'")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Blocking take shared by both channels.
    async fn wait_for(&self, channel: Channel, timeout: Duration) -> Result<Option<ItemId>> {
        let ready = match channel {
            Channel::Pending => &self.pending_ready,
            Channel::Missing => &self.missing_ready,
        };
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = match channel {
                Channel::Pending => self.claim_next().await?,
                Channel::Missing => self.take_missing().await?,
            };
            if taken.is_some() {
                return Ok(taken);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Pushes from other processes are only seen by polling
            let _ = tokio::time::timeout_at(deadline.min(now + POLL_INTERVAL), notified).await;
        }
    }

    async fn claim_next(&self) -> Result<Option<ItemId>> {
        let now = Utc::now().timestamp_millis();
        let claimable: i64 = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM items
                WHERE state = 'pending' OR (state = 'claimed' AND lease_until < ?1)
            )",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        if claimable == 0 {
            return Ok(None);
        }

        let mut tx = self.write_tx().await?;
        let expired = sqlx::query(
            "UPDATE items SET state = 'pending', lease_until = NULL
             WHERE state = 'claimed' AND lease_until < ?1",
        )
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if expired > 0 {
            log::warn!("Returned {expired} claims with expired leases to pending");
        }

        let lease_until = now + self.lease.as_millis() as i64;
        let id: Option<String> = sqlx::query_scalar(
            "UPDATE items SET state = 'claimed', lease_until = ?1
             WHERE id = (SELECT id FROM items WHERE state = 'pending' ORDER BY seq LIMIT 1)
             RETURNING id",
        )
        .bind(lease_until)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn take_missing(&self) -> Result<Option<ItemId>> {
        let waiting: i64 =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM items WHERE missing_seq IS NOT NULL)")
                .fetch_one(&self.pool)
                .await?;
        if waiting == 0 {
            return Ok(None);
        }

        let mut tx = self.write_tx().await?;
        let id: Option<String> = sqlx::query_scalar(
            "UPDATE items SET missing_seq = NULL
             WHERE id = (
                SELECT id FROM items WHERE missing_seq IS NOT NULL ORDER BY missing_seq LIMIT 1
             )
             RETURNING id",
        )
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }
}

fn counter_name(counter: Counter) -> &'static str {
    match counter {
        Counter::Changed => "changed",
        Counter::Unchanged => "unchanged",
        Counter::RestoredActive => "restored_active",
    }
}

async fn bump(conn: &mut SqliteConnection, name: &str, by: i64) -> Result<()> {
    if by == 0 {
        return Ok(());
    }
    sqlx::query(
        "INSERT INTO counters (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = value + excluded.value",
    )
    .bind(name)
    .bind(by)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Refresh `last_seen` of an item that has a snapshot.
async fn touch(conn: &mut SqliteConnection, id: &str, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE items SET last_seen = MAX(COALESCE(last_seen, 0), ?2)
         WHERE id = ?1 AND hash IS NOT NULL",
    )
    .bind(id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Sequence number placing an id at the back of pending.
async fn next_seq(conn: &mut SqliteConnection) -> Result<i64> {
    Ok(sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM items")
        .fetch_one(&mut *conn)
        .await?)
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    async fn enqueue_if_new(&self, ids: &[ItemId]) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let dedup = self.horizons.dedup.num_milliseconds();
        let inactive = self.horizons.inactive.num_milliseconds();

        let mut tx = self.write_tx().await?;
        bump(&mut tx, "discovered", ids.len() as i64).await?;
        let mut seq = next_seq(&mut tx).await?;
        let mut added = 0;

        for id in ids {
            let row: Option<(String, Option<i64>, Option<i64>, Option<i64>)> = sqlx::query_as(
                "SELECT state, fetched_at, inactive_at, missing_seq FROM items WHERE id = ?1",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((state, fetched_at, inactive_at, missing_seq)) = row {
                if state == PENDING || state == CLAIMED || missing_seq.is_some() {
                    touch(&mut tx, id, now).await?;
                    continue;
                }
                if inactive_at.is_some_and(|marked_at| now - marked_at < inactive) {
                    continue;
                }
                if state == PROCESSED {
                    touch(&mut tx, id, now).await?;
                    if fetched_at.is_some_and(|at| now - at < dedup) {
                        continue;
                    }
                }
            }

            sqlx::query(
                "INSERT INTO items (id, state, seq) VALUES (?1, 'pending', ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    state = 'pending', seq = excluded.seq, lease_until = NULL, inactive_at = NULL",
            )
            .bind(id)
            .bind(seq)
            .execute(&mut *tx)
            .await?;
            seq += 1;
            added += 1;
        }

        bump(&mut tx, "queued", added as i64).await?;
        tx.commit().await?;
        if added > 0 {
            self.pending_ready.notify_waiters();
        }
        Ok(added)
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<ItemId>> {
        self.wait_for(Channel::Pending, timeout).await
    }

    async fn release(&self, id: &str) -> Result<bool> {
        let mut tx = self.write_tx().await?;
        let front: i64 =
            sqlx::query_scalar("SELECT COALESCE(MIN(seq), 1) - 1 FROM items WHERE state = 'pending'")
                .fetch_one(&mut *tx)
                .await?;
        let released = sqlx::query(
            "UPDATE items SET state = 'pending', seq = ?2, lease_until = NULL
             WHERE id = ?1 AND state = 'claimed'",
        )
        .bind(id)
        .bind(front)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        tx.commit().await?;
        if released {
            self.pending_ready.notify_waiters();
        }
        Ok(released)
    }

    async fn is_processed(&self, id: &str) -> Result<bool> {
        let processed: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM items WHERE id = ?1 AND state = 'processed')",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(processed != 0)
    }

    async fn mark_processed(&self, id: &str) -> Result<()> {
        let mut tx = self.write_tx().await?;
        let entered = sqlx::query(
            "INSERT INTO items (id, state) VALUES (?1, 'processed')
             ON CONFLICT(id) DO UPDATE SET state = 'processed' WHERE items.state != 'processed'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        // A successful fetch proves the item exists
        sqlx::query(
            "UPDATE items SET seq = NULL, lease_until = NULL, attempts = 0, last_error = NULL,
                inactive_at = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        bump(&mut tx, "processed", entered as i64).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_snapshot(&self, id: &str, hash: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO items (id, hash, fetched_at, last_seen) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET
                hash = excluded.hash,
                fetched_at = excluded.fetched_at,
                last_seen = MAX(COALESCE(items.last_seen, 0), excluded.last_seen)",
        )
        .bind(id)
        .bind(hash)
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_changed(&self, id: &str, hash: &str) -> Result<bool> {
        let stored: Option<Option<String>> = sqlx::query_scalar("SELECT hash FROM items WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(stored.flatten().as_deref() != Some(hash))
    }

    async fn requeue_with_retry(&self, id: &str, max_attempts: u32, error: &str) -> Result<bool> {
        let mut tx = self.write_tx().await?;
        let row: Option<(String, i64)> = sqlx::query_as("SELECT state, attempts FROM items WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((state, attempts)) = row else {
            return Ok(false);
        };
        // Only the claim is counted; a repeated call reports the earlier result
        if state != CLAIMED {
            return Ok(state == PENDING);
        }

        let attempts = attempts + 1;
        let requeued = attempts < i64::from(max_attempts);
        if requeued {
            let seq = next_seq(&mut tx).await?;
            sqlx::query(
                "UPDATE items SET state = 'pending', seq = ?2, lease_until = NULL,
                    attempts = ?3, last_error = ?4
                 WHERE id = ?1",
            )
            .bind(id)
            .bind(seq)
            .bind(attempts)
            .bind(error)
            .execute(&mut *tx)
            .await?;
            bump(&mut tx, "retried", 1).await?;
        } else {
            sqlx::query(
                "UPDATE items SET state = 'idle', seq = NULL, lease_until = NULL,
                    attempts = 0, last_error = NULL
                 WHERE id = ?1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            bump(&mut tx, "permanently_failed", 1).await?;
        }
        tx.commit().await?;

        if requeued {
            self.pending_ready.notify_waiters();
        }
        Ok(requeued)
    }

    async fn retry_record(&self, id: &str) -> Result<Option<RetryRecord>> {
        let row: Option<(i64, Option<String>)> =
            sqlx::query_as("SELECT attempts, last_error FROM items WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row
            .filter(|(attempts, _)| *attempts > 0)
            .map(|(attempts, last_error)| RetryRecord {
                attempts: attempts as u32,
                last_error,
            }))
    }

    async fn mark_not_found(&self, id: &str) -> Result<()> {
        let mut tx = self.write_tx().await?;
        let dropped = sqlx::query(
            "UPDATE items SET state = 'idle', seq = NULL, lease_until = NULL,
                attempts = 0, last_error = NULL
             WHERE id = ?1 AND state = 'claimed'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        bump(&mut tx, "not_found", dropped as i64).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn push_missing(&self, ids: &[ItemId]) -> Result<usize> {
        let mut tx = self.write_tx().await?;
        let mut seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(missing_seq), 0) + 1 FROM items")
            .fetch_one(&mut *tx)
            .await?;
        let mut added = 0;
        for id in ids {
            let flagged = sqlx::query(
                "UPDATE items SET missing_seq = ?2
                 WHERE id = ?1 AND missing_seq IS NULL AND inactive_at IS NULL
                    AND state NOT IN ('pending', 'claimed')",
            )
            .bind(id)
            .bind(seq)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if flagged > 0 {
                seq += 1;
                added += 1;
            }
        }
        bump(&mut tx, "missing_candidates", added as i64).await?;
        tx.commit().await?;
        if added > 0 {
            self.missing_ready.notify_waiters();
        }
        Ok(added)
    }

    async fn pop_missing(&self, timeout: Duration) -> Result<Option<ItemId>> {
        self.wait_for(Channel::Missing, timeout).await
    }

    async fn mark_verified_inactive(&self, id: &str) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.write_tx().await?;
        let marked_at: Option<Option<i64>> =
            sqlx::query_scalar("SELECT inactive_at FROM items WHERE id = ?1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        sqlx::query("UPDATE items SET state = 'idle', seq = NULL WHERE id = ?1 AND state = 'processed'")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let first = marked_at.flatten().is_none();
        if first {
            sqlx::query(
                "INSERT INTO items (id, inactive_at) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET inactive_at = excluded.inactive_at",
            )
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            bump(&mut tx, "verified_inactive", 1).await?;
        }
        tx.commit().await?;
        Ok(first)
    }

    async fn update_last_seen(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.write_tx().await?;
        touch(&mut tx, id, now).await?;
        sqlx::query(
            "UPDATE items SET
                inactive_at = NULL,
                state = CASE WHEN state = 'idle' AND hash IS NOT NULL THEN 'processed' ELSE state END
             WHERE id = ?1 AND inactive_at IS NOT NULL",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_stale(&self, threshold: chrono::Duration) -> Result<Vec<ItemId>> {
        let cutoff = (Utc::now() - threshold).timestamp_millis();
        Ok(sqlx::query_scalar(
            "SELECT id FROM items
             WHERE state = 'processed' AND inactive_at IS NULL AND missing_seq IS NULL
                AND last_seen < ?1
             ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn incr(&self, counter: Counter) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        bump(&mut conn, counter_name(counter), 1).await
    }

    async fn stats(&self) -> Result<PipelineStats> {
        let counters: Vec<(String, i64)> = sqlx::query_as("SELECT name, value FROM counters")
            .fetch_all(&self.pool)
            .await?;
        let (pending, claimed, missing, processed, inactive): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT
                    COALESCE(SUM(state = 'pending'), 0),
                    COALESCE(SUM(state = 'claimed'), 0),
                    COALESCE(SUM(missing_seq IS NOT NULL), 0),
                    COALESCE(SUM(state = 'processed'), 0),
                    COALESCE(SUM(inactive_at IS NOT NULL), 0)
                 FROM items",
            )
            .fetch_one(&self.pool)
            .await?;

        let mut stats = PipelineStats {
            gauges: QueueGauges {
                pending: pending as usize,
                claimed: claimed as usize,
                missing: missing as usize,
                processed_total: processed as usize,
                inactive_total: inactive as usize,
            },
            ..PipelineStats::default()
        };
        for (name, value) in counters {
            let value = value.max(0) as u64;
            match name.as_str() {
                "discovered" => stats.discovered = value,
                "queued" => stats.queued = value,
                "processed" => stats.processed = value,
                "changed" => stats.changed = value,
                "unchanged" => stats.unchanged = value,
                "not_found" => stats.not_found = value,
                "retried" => stats.retried = value,
                "permanently_failed" => stats.permanently_failed = value,
                "missing_candidates" => stats.missing_candidates = value,
                "verified_inactive" => stats.verified_inactive = value,
                "restored_active" => stats.restored_active = value,
                other => log::debug!("Ignoring unknown counter {other}"),
            }
        }
        Ok(stats)
    }

    async fn record_pass(&self, record: PassRecord) -> Result<()> {
        let json = serde_json::to_string(&record)?;
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES ('last_pass', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_pass(&self) -> Result<Option<PassRecord>> {
        let json: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = 'last_pass'")
            .fetch_optional(&self.pool)
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.pending_ready.notify_waiters();
        self.missing_ready.notify_waiters();
        self.pool.close().await;
        Ok(())
    }
}
