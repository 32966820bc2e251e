// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The embedded job store.
//!
//! A single SQLite file holds three tables: `jobs`, `sub_jobs` and
//! `workers`. The schema is created idempotently at open. All write paths
//! hold a process-wide mutex so that multi-statement operations (claim,
//! complete, reclaim) are serialisable; reads run concurrently on the pool.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::store::error::{StoreError, StoreResult};
use crate::store::models::{
    sub_job_id, ClaimedBatch, Job, JobStatus, NewJob, SubJob, SubJobStatus, WorkerRecord,
    WorkerStatus,
};

/// Failure reason recorded when a batch exceeds its reclaim retry budget.
pub const LOST_WORKER_REASON: &str = "LostWorker";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    renderer TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    progress REAL NOT NULL DEFAULT 0.0,
    priority TEXT NOT NULL DEFAULT 'normal',
    job_data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS sub_jobs (
    id TEXT PRIMARY KEY,
    parent_job_id TEXT NOT NULL REFERENCES jobs (id),
    batch_number INTEGER NOT NULL,
    frame_range TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    worker_id TEXT,
    started_at TEXT,
    completed_at TEXT,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sub_jobs_status ON sub_jobs (status);
CREATE INDEX IF NOT EXISTS idx_sub_jobs_parent ON sub_jobs (parent_job_id);

CREATE TABLE IF NOT EXISTS workers (
    id TEXT PRIMARY KEY,
    ip_address TEXT NOT NULL,
    hostname TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'offline',
    capabilities TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL,
    registered_at TEXT NOT NULL
);
"#;

/// Priority rank expression shared by the claim queries.
const PRIORITY_RANK: &str = r"
    CASE j.priority
        WHEN 'critical' THEN 1
        WHEN 'high' THEN 2
        WHEN 'normal' THEN 3
        WHEN 'low' THEN 4
        ELSE 5
    END
";

/// Outcome of a completion report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The batch transitioned to a terminal state
    Updated,
    /// The owning worker re-reported an already-terminal batch; no-op
    AlreadyComplete,
}

/// Embedded store handle. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Self::init(pool, &path.display().to_string()).await
    }

    /// Open an in-memory store. Used by tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Self::init(pool, ":memory:").await
    }

    async fn init(pool: SqlitePool, label: &str) -> StoreResult<Self> {
        // One statement per query; the driver prepares them individually.
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&pool).await?;
            }
        }
        info!(store = label, "store opened");

        Ok(Self {
            pool,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        debug!("closing store");
        self.pool.close().await;
    }

    // --- jobs -----------------------------------------------------------

    /// Insert a job and all of its batches in one transaction.
    pub async fn insert_job(&self, new: NewJob) -> StoreResult<Job> {
        if new.batches.is_empty() {
            return Err(StoreError::InvalidInput("job has no batches".to_string()));
        }

        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO jobs (id, title, renderer, status, progress, priority, job_data, created_at)
            VALUES (?, ?, ?, 'pending', 0.0, ?, ?, ?)
            ",
        )
        .bind(&new.id)
        .bind(&new.title)
        .bind(&new.renderer)
        .bind(new.priority)
        .bind(Json(&new.job_data))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (i, frame_range) in new.batches.iter().enumerate() {
            sqlx::query(
                r"
                INSERT INTO sub_jobs (id, parent_job_id, batch_number, frame_range, status)
                VALUES (?, ?, ?, ?, 'pending')
                ",
            )
            .bind(sub_job_id(&new.id, i + 1))
            .bind(&new.id)
            .bind((i + 1) as i64)
            .bind(frame_range)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(job_id = %new.id, batches = new.batches.len(), "job inserted");

        self.get_job(&new.id).await
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, id: &str) -> StoreResult<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
    }

    /// All jobs, newest first.
    pub async fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        Ok(
            sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Total number of jobs.
    pub async fn count_jobs(&self) -> StoreResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// All batches of a job in batch order.
    pub async fn list_sub_jobs(&self, job_id: &str) -> StoreResult<Vec<SubJob>> {
        Ok(sqlx::query_as::<_, SubJob>(
            "SELECT * FROM sub_jobs WHERE parent_job_id = ? ORDER BY batch_number ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Fetch a batch by id.
    pub async fn get_sub_job(&self, id: &str) -> StoreResult<SubJob> {
        sqlx::query_as::<_, SubJob>("SELECT * FROM sub_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("sub-job {id}")))
    }

    // --- claiming -------------------------------------------------------

    /// Claim the next pending batch for a worker.
    ///
    /// Selection order is priority (critical > high > normal > low), then
    /// parent job age, then batch index. The first candidate is marked
    /// running and returned; up to `prefetch - 1` further candidates are
    /// returned still-pending so the dispatcher can cache them.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        prefetch: usize,
    ) -> StoreResult<(Option<ClaimedBatch>, Vec<ClaimedBatch>)> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r"
            SELECT sj.id, sj.parent_job_id, sj.frame_range, j.job_data
            FROM sub_jobs sj
            JOIN jobs j ON sj.parent_job_id = j.id
            WHERE sj.status = 'pending'
              AND j.status IN ('pending', 'running')
            ORDER BY {PRIORITY_RANK}, j.created_at ASC, sj.batch_number ASC
            LIMIT ?
            "
        );

        let rows = sqlx::query_as::<_, (String, String, String, Json<serde_json::Value>)>(&sql)
            .bind(prefetch.max(1) as i64)
            .fetch_all(&mut *tx)
            .await?;

        let mut candidates = rows.into_iter().map(|(id, parent, frames, data)| ClaimedBatch {
            sub_job_id: id,
            parent_job_id: parent,
            frame_range: frames,
            job_data: data.0,
        });

        let Some(claimed) = candidates.next() else {
            return Ok((None, Vec::new()));
        };

        mark_running(&mut tx, &claimed, worker_id, now).await?;
        tx.commit().await?;

        debug!(sub_job_id = %claimed.sub_job_id, worker_id, "batch claimed");
        Ok((Some(claimed), candidates.collect()))
    }

    /// Claim a specific batch on behalf of a worker. Succeeds only while
    /// the batch is still pending; returns `None` when it was taken or
    /// invalidated since it was cached.
    pub async fn claim_sub_job(
        &self,
        sub_job_id: &str,
        worker_id: &str,
    ) -> StoreResult<Option<ClaimedBatch>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (String, String, String, Json<serde_json::Value>)>(
            r"
            SELECT sj.id, sj.parent_job_id, sj.frame_range, j.job_data
            FROM sub_jobs sj
            JOIN jobs j ON sj.parent_job_id = j.id
            WHERE sj.id = ?
              AND sj.status = 'pending'
              AND j.status IN ('pending', 'running')
            ",
        )
        .bind(sub_job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, parent, frames, data)) = row else {
            return Ok(None);
        };

        let claimed = ClaimedBatch {
            sub_job_id: id,
            parent_job_id: parent,
            frame_range: frames,
            job_data: data.0,
        };

        mark_running(&mut tx, &claimed, worker_id, now).await?;
        tx.commit().await?;

        Ok(Some(claimed))
    }

    // --- completion -----------------------------------------------------

    /// Record a completion report for a batch.
    ///
    /// Only the worker the batch is assigned to may complete it; a repeated
    /// report from that worker against an already-terminal batch is a
    /// no-op. Recomputes parent progress, and rolls the parent up to
    /// completed/failed once every batch is terminal.
    pub async fn complete_sub_job(
        &self,
        sub_job_id: &str,
        worker_id: &str,
        success: bool,
        error_message: Option<&str>,
    ) -> StoreResult<CompletionOutcome> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (SubJobStatus, Option<String>, String)>(
            "SELECT status, worker_id, parent_job_id FROM sub_jobs WHERE id = ?",
        )
        .bind(sub_job_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((status, owner, parent_job_id)) = row else {
            return Err(StoreError::NotFound(format!("sub-job {sub_job_id}")));
        };

        let owned = owner.as_deref() == Some(worker_id);

        match status {
            SubJobStatus::Completed | SubJobStatus::Failed if owned => {
                // Idempotent retry of a delivered report.
                return Ok(CompletionOutcome::AlreadyComplete);
            }
            SubJobStatus::Running if owned => {}
            _ => {
                return Err(StoreError::NotAssigned(format!(
                    "sub-job {sub_job_id} is not running for worker {worker_id}"
                )));
            }
        }

        let new_status = if success {
            SubJobStatus::Completed
        } else {
            SubJobStatus::Failed
        };

        sqlx::query(
            "UPDATE sub_jobs SET status = ?, completed_at = ?, error_message = ? WHERE id = ?",
        )
        .bind(new_status)
        .bind(now)
        .bind(error_message)
        .bind(sub_job_id)
        .execute(&mut *tx)
        .await?;

        rollup_job(&mut tx, &parent_job_id, now).await?;
        tx.commit().await?;

        debug!(sub_job_id, worker_id, success, "batch completed");
        Ok(CompletionOutcome::Updated)
    }

    // --- job control ----------------------------------------------------

    /// Pause one job: the job and its running batches move to paused.
    pub async fn pause_job(&self, job_id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE jobs SET status = 'paused' WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            // Either unknown or already terminal/paused.
            let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("job {job_id}")));
            }
        }

        sqlx::query(
            "UPDATE sub_jobs SET status = 'paused' WHERE parent_job_id = ? AND status = 'running'",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Resume one job: paused batches return to pending (they are
    /// re-issued, not resumed in place).
    pub async fn resume_job(&self, job_id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE sub_jobs SET status = 'pending', worker_id = NULL, started_at = NULL
             WHERE parent_job_id = ? AND status = 'paused'",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            r"
            UPDATE jobs SET status = CASE
                WHEN started_at IS NULL THEN 'pending'
                ELSE 'running'
            END
            WHERE id = ? AND status = 'paused'
            ",
        )
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("job {job_id}")));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Cancel one job: the job and its non-terminal batches move to
    /// cancelled. A worker still rendering a cancelled batch has its
    /// eventual report rejected and dropped.
    pub async fn cancel_job(&self, job_id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?
             WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("job {job_id}")));
            }
        }

        sqlx::query(
            "UPDATE sub_jobs SET status = 'cancelled', completed_at = ?
             WHERE parent_job_id = ? AND status IN ('pending', 'running', 'paused')",
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Pause every pending/running job.
    pub async fn pause_all(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE jobs SET status = 'paused' WHERE status IN ('pending', 'running')")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE sub_jobs SET status = 'paused' WHERE status = 'running'")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Resume every paused job.
    pub async fn resume_all(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE sub_jobs SET status = 'pending', worker_id = NULL, started_at = NULL
             WHERE status = 'paused'",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r"
            UPDATE jobs SET status = CASE
                WHEN started_at IS NULL THEN 'pending'
                ELSE 'running'
            END
            WHERE status = 'paused'
            ",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete completed jobs and their batches transactionally. Returns the
    /// number of jobs removed.
    pub async fn clear_completed(&self) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM sub_jobs WHERE parent_job_id IN
             (SELECT id FROM jobs WHERE status = 'completed')",
        )
        .execute(&mut *tx)
        .await?;

        let removed = sqlx::query("DELETE FROM jobs WHERE status = 'completed'")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        info!(removed, "completed jobs cleared");
        Ok(removed)
    }

    // --- workers --------------------------------------------------------

    /// Register (or re-register) a worker.
    pub async fn upsert_worker(
        &self,
        id: &str,
        ip_address: &str,
        hostname: &str,
        capabilities: &serde_json::Value,
    ) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        sqlx::query(
            r"
            INSERT INTO workers (id, ip_address, hostname, status, capabilities, last_heartbeat, registered_at)
            VALUES (?, ?, ?, 'online', ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                ip_address = excluded.ip_address,
                hostname = excluded.hostname,
                status = 'online',
                capabilities = excluded.capabilities,
                last_heartbeat = excluded.last_heartbeat
            ",
        )
        .bind(id)
        .bind(ip_address)
        .bind(hostname)
        .bind(Json(capabilities))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stamp a worker's heartbeat. The dispatcher rate-limits calls to one
    /// per 30 seconds per worker to cut store I/O.
    pub async fn touch_worker(&self, id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let updated =
            sqlx::query("UPDATE workers SET last_heartbeat = ?, status = 'online' WHERE id = ?")
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?
                .rows_affected();

        if updated == 0 {
            return Err(StoreError::NotFound(format!("worker {id}")));
        }
        Ok(())
    }

    /// Whether a worker row exists.
    pub async fn worker_exists(&self, id: &str) -> StoreResult<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// All workers, most recently heartbeating first, with online/offline
    /// derived from heartbeat age. An explicitly stopped worker stays
    /// stopped regardless of heartbeat.
    pub async fn list_workers(&self, online_window: Duration) -> StoreResult<Vec<WorkerRecord>> {
        let cutoff = Utc::now() - online_window;

        let mut workers =
            sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers ORDER BY last_heartbeat DESC")
                .fetch_all(&self.pool)
                .await?;

        for worker in &mut workers {
            if worker.status != WorkerStatus::Stopped {
                worker.status = if worker.last_heartbeat > cutoff {
                    WorkerStatus::Online
                } else {
                    WorkerStatus::Offline
                };
            }
        }

        Ok(workers)
    }

    /// Count workers whose heartbeat is within the window.
    pub async fn count_online_workers(&self, window: Duration) -> StoreResult<i64> {
        let cutoff = Utc::now() - window;
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workers WHERE status != 'stopped' AND last_heartbeat > ?",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Mark a worker as stopped.
    pub async fn stop_worker(&self, id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let updated = sqlx::query("UPDATE workers SET status = 'stopped' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(StoreError::NotFound(format!("worker {id}")));
        }
        Ok(())
    }

    /// Delete a worker row.
    pub async fn remove_worker(&self, id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let removed = sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if removed == 0 {
            return Err(StoreError::NotFound(format!("worker {id}")));
        }
        Ok(())
    }

    /// Drop stopped workers whose last heartbeat predates the cutoff.
    pub async fn forget_stopped_workers(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;

        let removed =
            sqlx::query("DELETE FROM workers WHERE status = 'stopped' AND last_heartbeat < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();

        Ok(removed)
    }

    // --- reclaim --------------------------------------------------------

    /// Return running batches on lost workers to the pending queue.
    ///
    /// A worker is lost when its stored heartbeat predates `cutoff` and its
    /// id is not in `fresh` (workers recently seen by the dispatcher cache,
    /// whose store row may lag behind the rate-limited writes). Each
    /// reclaim increments the batch retry count; past `max_retries` the
    /// batch fails with reason `LostWorker` instead. Returns the ids of
    /// batches returned to pending. Reclaiming twice without intervening
    /// heartbeats is a no-op the second time.
    pub async fn reclaim_lost(
        &self,
        cutoff: DateTime<Utc>,
        fresh: &HashSet<String>,
        max_retries: i64,
    ) -> StoreResult<Vec<String>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let candidates = sqlx::query_as::<_, (String, Option<String>, i64, String)>(
            r"
            SELECT sj.id, sj.worker_id, sj.retry_count, sj.parent_job_id
            FROM sub_jobs sj
            LEFT JOIN workers w ON sj.worker_id = w.id
            WHERE sj.status = 'running'
              AND (w.id IS NULL OR w.last_heartbeat < ?)
            ",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = Vec::new();
        let mut failed_parents = Vec::new();

        for (id, worker, retry_count, parent) in candidates {
            if let Some(worker) = &worker {
                if fresh.contains(worker) {
                    continue;
                }
            }

            if retry_count + 1 > max_retries {
                sqlx::query(
                    r"
                    UPDATE sub_jobs
                    SET status = 'failed', worker_id = NULL, completed_at = ?,
                        error_message = ?, retry_count = retry_count + 1
                    WHERE id = ?
                    ",
                )
                .bind(now)
                .bind(LOST_WORKER_REASON)
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                failed_parents.push(parent);
            } else {
                sqlx::query(
                    r"
                    UPDATE sub_jobs
                    SET status = 'pending', worker_id = NULL, started_at = NULL,
                        retry_count = retry_count + 1
                    WHERE id = ?
                    ",
                )
                .bind(&id)
                .execute(&mut *tx)
                .await?;
                reclaimed.push(id);
            }
        }

        failed_parents.sort();
        failed_parents.dedup();
        for parent in failed_parents {
            rollup_job(&mut tx, &parent, now).await?;
        }

        tx.commit().await?;

        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "batches reclaimed from lost workers");
        }
        Ok(reclaimed)
    }
}

/// Mark a claimed batch running and promote a pending parent.
async fn mark_running(
    tx: &mut Transaction<'_, Sqlite>,
    claimed: &ClaimedBatch,
    worker_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "UPDATE sub_jobs SET status = 'running', worker_id = ?, started_at = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(worker_id)
    .bind(now)
    .bind(&claimed.sub_job_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "UPDATE jobs SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(now)
    .bind(&claimed.parent_job_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Recompute a job's progress and, once all batches are terminal, its
/// terminal status. Progress is completed / total in [0, 1].
async fn rollup_job(
    tx: &mut Transaction<'_, Sqlite>,
    job_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let (total, completed, terminal, failed): (i64, Option<i64>, Option<i64>, Option<i64>) =
        sqlx::query_as(
            r"
            SELECT COUNT(*),
                   SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN status IN ('completed', 'failed', 'cancelled') THEN 1 ELSE 0 END),
                   SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END)
            FROM sub_jobs
            WHERE parent_job_id = ?
            ",
        )
        .bind(job_id)
        .fetch_one(&mut **tx)
        .await?;

    let completed = completed.unwrap_or(0);
    let terminal = terminal.unwrap_or(0);
    let failed = failed.unwrap_or(0);

    let progress = if total > 0 {
        completed as f64 / total as f64
    } else {
        0.0
    };

    sqlx::query("UPDATE jobs SET progress = ? WHERE id = ?")
        .bind(progress)
        .bind(job_id)
        .execute(&mut **tx)
        .await?;

    if total > 0 && terminal == total {
        let status: Option<(JobStatus,)> = sqlx::query_as("SELECT status FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut **tx)
            .await?;

        // An operator cancellation is final; it is not overwritten here.
        if let Some((current,)) = status {
            if current != JobStatus::Cancelled {
                let terminal_status = if failed > 0 {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                };
                sqlx::query(
                    "UPDATE jobs SET status = ?, completed_at = COALESCE(completed_at, ?)
                     WHERE id = ?",
                )
                .bind(terminal_status)
                .bind(now)
                .bind(job_id)
                .execute(&mut **tx)
                .await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::Priority;
    use serde_json::json;

    async fn test_store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    fn new_job(id: &str, priority: Priority, batches: &[&str]) -> NewJob {
        NewJob {
            id: id.to_string(),
            title: format!("job {id}"),
            renderer: "nuke".to_string(),
            priority,
            job_data: json!({"file_path": "/mnt/projects/shot.nk"}),
            batches: batches.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch_job() {
        let store = test_store().await;
        let job = store
            .insert_job(new_job("j1", Priority::Normal, &["1-2", "3-4"]))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);

        let batches = store.list_sub_jobs("j1").await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].id, "j1_batch_001");
        assert_eq!(batches[0].batch_number, 1);
        assert_eq!(batches[1].frame_range, "3-4");
        assert_eq!(store.count_jobs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_job_rejected() {
        let store = test_store().await;
        let err = store
            .insert_job(new_job("j1", Priority::Normal, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_claim_priority_and_age_order() {
        let store = test_store().await;
        store
            .insert_job(new_job("j1", Priority::Normal, &["1-3", "4-6", "7-9"]))
            .await
            .unwrap();
        store
            .insert_job(new_job("j2", Priority::Critical, &["1-5", "6-10"]))
            .await
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..5 {
            let (claimed, _) = store.claim_next("w1", 1).await.unwrap();
            order.push(claimed.unwrap().sub_job_id);
        }

        assert_eq!(
            order,
            vec![
                "j2_batch_001",
                "j2_batch_002",
                "j1_batch_001",
                "j1_batch_002",
                "j1_batch_003"
            ]
        );

        let (none, _) = store.claim_next("w1", 1).await.unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_claim_marks_running_and_prefetches() {
        let store = test_store().await;
        store
            .insert_job(new_job("j1", Priority::Normal, &["1-2", "3-4", "5-6"]))
            .await
            .unwrap();

        let (claimed, rest) = store.claim_next("w1", 3).await.unwrap();
        let claimed = claimed.unwrap();
        assert_eq!(claimed.sub_job_id, "j1_batch_001");
        assert_eq!(rest.len(), 2);

        let batch = store.get_sub_job("j1_batch_001").await.unwrap();
        assert_eq!(batch.status, SubJobStatus::Running);
        assert_eq!(batch.worker_id.as_deref(), Some("w1"));
        assert!(batch.started_at.is_some());

        // Prefetched candidates stay pending until claimed through.
        let second = store.get_sub_job("j1_batch_002").await.unwrap();
        assert_eq!(second.status, SubJobStatus::Pending);

        let job = store.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_sub_job_once_only() {
        let store = test_store().await;
        store
            .insert_job(new_job("j1", Priority::Normal, &["1-2"]))
            .await
            .unwrap();

        let first = store.claim_sub_job("j1_batch_001", "w1").await.unwrap();
        assert!(first.is_some());

        let second = store.claim_sub_job("j1_batch_001", "w2").await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_fraction() {
        let store = test_store().await;
        store
            .insert_job(new_job("j1", Priority::Normal, &["1", "2", "3", "4"]))
            .await
            .unwrap();

        let mut last = 0.0;
        for i in 1..=4 {
            let id = sub_job_id("j1", i);
            store.claim_sub_job(&id, "w1").await.unwrap().unwrap();
            store.complete_sub_job(&id, "w1", true, None).await.unwrap();

            let job = store.get_job("j1").await.unwrap();
            assert!((job.progress - i as f64 / 4.0).abs() < f64::EPSILON);
            assert!(job.progress >= last);
            last = job.progress;
        }

        let job = store.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_batch_fails_parent_when_all_terminal() {
        let store = test_store().await;
        store
            .insert_job(new_job("j1", Priority::Normal, &["1", "2"]))
            .await
            .unwrap();

        store.claim_sub_job("j1_batch_001", "w1").await.unwrap();
        store
            .complete_sub_job("j1_batch_001", "w1", false, Some("RendererFailed: exit 1"))
            .await
            .unwrap();

        // Failure is recorded but not propagated until all terminal.
        let job = store.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Running);

        store.claim_sub_job("j1_batch_002", "w1").await.unwrap();
        store
            .complete_sub_job("j1_batch_002", "w1", true, None)
            .await
            .unwrap();

        let job = store.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!((job.progress - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_completion_idempotent_for_owner() {
        let store = test_store().await;
        store
            .insert_job(new_job("j1", Priority::Normal, &["1", "2"]))
            .await
            .unwrap();

        store.claim_sub_job("j1_batch_001", "w1").await.unwrap();
        let first = store
            .complete_sub_job("j1_batch_001", "w1", true, None)
            .await
            .unwrap();
        assert_eq!(first, CompletionOutcome::Updated);

        let again = store
            .complete_sub_job("j1_batch_001", "w1", true, None)
            .await
            .unwrap();
        assert_eq!(again, CompletionOutcome::AlreadyComplete);

        let job = store.get_job("j1").await.unwrap();
        assert!((job.progress - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_completion_rejected_for_non_owner() {
        let store = test_store().await;
        store
            .insert_job(new_job("j1", Priority::Normal, &["1"]))
            .await
            .unwrap();

        store.claim_sub_job("j1_batch_001", "w1").await.unwrap();

        let err = store
            .complete_sub_job("j1_batch_001", "w2", true, None)
            .await
            .unwrap_err();
        assert!(err.is_not_assigned());

        // Losing worker did not mutate anything.
        let batch = store.get_sub_job("j1_batch_001").await.unwrap();
        assert_eq!(batch.status, SubJobStatus::Running);
        assert_eq!(batch.worker_id.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_completion_unknown_sub_job() {
        let store = test_store().await;
        let err = store
            .complete_sub_job("missing", "w1", true, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let store = test_store().await;
        store
            .insert_job(new_job("j1", Priority::Normal, &["1", "2"]))
            .await
            .unwrap();

        store.claim_sub_job("j1_batch_001", "w1").await.unwrap();
        store.pause_job("j1").await.unwrap();

        let job = store.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        let batch = store.get_sub_job("j1_batch_001").await.unwrap();
        assert_eq!(batch.status, SubJobStatus::Paused);

        // Paused jobs dispatch nothing, even with pending batches left.
        let (none, _) = store.claim_next("w2", 1).await.unwrap();
        assert!(none.is_none());

        store.resume_job("j1").await.unwrap();
        let batch = store.get_sub_job("j1_batch_001").await.unwrap();
        assert_eq!(batch.status, SubJobStatus::Pending);
        assert!(batch.worker_id.is_none());

        let (claimed, _) = store.claim_next("w2", 1).await.unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn test_cancel_job_drops_late_report() {
        let store = test_store().await;
        store
            .insert_job(new_job("j1", Priority::Normal, &["1"]))
            .await
            .unwrap();

        store.claim_sub_job("j1_batch_001", "w1").await.unwrap();
        store.cancel_job("j1").await.unwrap();

        let job = store.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        // The worker's late completion is rejected and changes nothing.
        let err = store
            .complete_sub_job("j1_batch_001", "w1", true, None)
            .await
            .unwrap_err();
        assert!(err.is_not_assigned());

        let batch = store.get_sub_job("j1_batch_001").await.unwrap();
        assert_eq!(batch.status, SubJobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_clear_completed_preserves_referential_integrity() {
        let store = test_store().await;
        store
            .insert_job(new_job("j1", Priority::Normal, &["1", "2"]))
            .await
            .unwrap();
        store
            .insert_job(new_job("j2", Priority::Normal, &["1"]))
            .await
            .unwrap();

        for i in 1..=2 {
            let id = sub_job_id("j1", i);
            store.claim_sub_job(&id, "w1").await.unwrap();
            store.complete_sub_job(&id, "w1", true, None).await.unwrap();
        }

        let removed = store.clear_completed().await.unwrap();
        assert_eq!(removed, 1);

        assert!(store.get_job("j1").await.unwrap_err().is_not_found());
        assert!(store.list_sub_jobs("j1").await.unwrap().is_empty());

        // The unfinished job is untouched.
        assert!(store.get_job("j2").await.is_ok());
        assert_eq!(store.list_sub_jobs("j2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_registration_and_heartbeat() {
        let store = test_store().await;
        store
            .upsert_worker("w1", "10.0.0.5", "render01", &json!({"cpu_count": 16}))
            .await
            .unwrap();

        assert!(store.worker_exists("w1").await.unwrap());
        assert!(!store.worker_exists("w2").await.unwrap());

        store.touch_worker("w1").await.unwrap();
        assert!(store.touch_worker("w2").await.unwrap_err().is_not_found());

        assert_eq!(
            store
                .count_online_workers(Duration::seconds(30))
                .await
                .unwrap(),
            1
        );

        let workers = store.list_workers(Duration::seconds(30)).await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].status, WorkerStatus::Online);
    }

    #[tokio::test]
    async fn test_stopped_worker_not_counted_online() {
        let store = test_store().await;
        store
            .upsert_worker("w1", "10.0.0.5", "render01", &json!({}))
            .await
            .unwrap();
        store.stop_worker("w1").await.unwrap();

        assert_eq!(
            store
                .count_online_workers(Duration::seconds(30))
                .await
                .unwrap(),
            0
        );

        let workers = store.list_workers(Duration::seconds(30)).await.unwrap();
        assert_eq!(workers[0].status, WorkerStatus::Stopped);

        store.remove_worker("w1").await.unwrap();
        assert!(!store.worker_exists("w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reclaim_lost_worker_is_idempotent() {
        let store = test_store().await;
        store
            .upsert_worker("w1", "10.0.0.5", "render01", &json!({}))
            .await
            .unwrap();
        store
            .insert_job(new_job("j1", Priority::Normal, &["1-2"]))
            .await
            .unwrap();
        store.claim_sub_job("j1_batch_001", "w1").await.unwrap();

        // Heartbeat newer than the cutoff: nothing to do.
        let past_cutoff = Utc::now() - Duration::seconds(90);
        let fresh = HashSet::new();
        let reclaimed = store.reclaim_lost(past_cutoff, &fresh, 3).await.unwrap();
        assert!(reclaimed.is_empty());

        // Cutoff ahead of the heartbeat: the batch is reclaimed once.
        let future_cutoff = Utc::now() + Duration::seconds(1);
        let reclaimed = store.reclaim_lost(future_cutoff, &fresh, 3).await.unwrap();
        assert_eq!(reclaimed, vec!["j1_batch_001".to_string()]);

        let batch = store.get_sub_job("j1_batch_001").await.unwrap();
        assert_eq!(batch.status, SubJobStatus::Pending);
        assert_eq!(batch.retry_count, 1);
        assert!(batch.worker_id.is_none());

        // Sweeping again reclaims nothing new.
        let again = store.reclaim_lost(future_cutoff, &fresh, 3).await.unwrap();
        assert!(again.is_empty());

        // Another worker can pick it up and finish it.
        store.claim_sub_job("j1_batch_001", "w2").await.unwrap();
        store
            .complete_sub_job("j1_batch_001", "w2", true, None)
            .await
            .unwrap();
        let job = store.get_job("j1").await.unwrap();
        assert!((job.progress - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_reclaim_respects_fresh_cache_pulse() {
        let store = test_store().await;
        store
            .upsert_worker("w1", "10.0.0.5", "render01", &json!({}))
            .await
            .unwrap();
        store
            .insert_job(new_job("j1", Priority::Normal, &["1"]))
            .await
            .unwrap();
        store.claim_sub_job("j1_batch_001", "w1").await.unwrap();

        let mut fresh = HashSet::new();
        fresh.insert("w1".to_string());

        let cutoff = Utc::now() + Duration::seconds(1);
        let reclaimed = store.reclaim_lost(cutoff, &fresh, 3).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_fails_batch_past_retry_limit() {
        let store = test_store().await;
        store
            .upsert_worker("w1", "10.0.0.5", "render01", &json!({}))
            .await
            .unwrap();
        store
            .insert_job(new_job("j1", Priority::Normal, &["1"]))
            .await
            .unwrap();

        let fresh = HashSet::new();
        let cutoff_later = || Utc::now() + Duration::seconds(1);

        for round in 1..=3 {
            store.claim_sub_job("j1_batch_001", "w1").await.unwrap();
            let reclaimed = store.reclaim_lost(cutoff_later(), &fresh, 3).await.unwrap();
            assert_eq!(reclaimed.len(), 1, "round {round}");
        }

        // Fourth loss exceeds the budget.
        store.claim_sub_job("j1_batch_001", "w1").await.unwrap();
        let reclaimed = store.reclaim_lost(cutoff_later(), &fresh, 3).await.unwrap();
        assert!(reclaimed.is_empty());

        let batch = store.get_sub_job("j1_batch_001").await.unwrap();
        assert_eq!(batch.status, SubJobStatus::Failed);
        assert_eq!(batch.error_message.as_deref(), Some(LOST_WORKER_REASON));
        assert_eq!(batch.retry_count, 4);

        let job = store.get_job("j1").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }
}
