// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The dispatcher service.
//!
//! Owns the store, the in-memory caches and the per-worker heartbeat
//! clock. The HTTP layer is a thin translation onto the operations here.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::batch::{plan_frame_range, BatchError};
use crate::dispatch::cache::{CacheStats, DispatchCache, WorkerPulse};
use crate::dispatch::paths;
use crate::dispatch::protocol::{
    CompleteRequest, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
    StatusResponse, SubmitJobRequest,
};
use crate::store::{
    ClaimedBatch, CompletionOutcome, Job, NewJob, Store, StoreError, SubJob, WorkerRecord,
};
use crate::worker::renderers::RendererKind;

/// Dispatcher errors, mapped onto HTTP statuses by the API layer.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Unparsable frame range or batch size
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Store failure (not found, conflict, SQL)
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Submission names a renderer the farm does not support
    #[error("unknown renderer: {0}")]
    UnknownRenderer(String),
}

/// Dispatcher result type
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Tunables for the dispatcher and its sweep task.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Minimum gap between store heartbeat writes per worker (seconds)
    pub heartbeat_db_write_secs: u64,
    /// Cache-based online window (heartbeat interval + buffer, seconds)
    pub online_window_secs: i64,
    /// Store-based online window used when the cache is empty (seconds)
    pub store_online_window_secs: i64,
    /// Heartbeat gap past which a worker's running batches are reclaimed
    pub reclaim_window_secs: i64,
    /// Sweep period (seconds)
    pub sweep_interval_secs: u64,
    /// Stopped workers silent for longer than this are dropped (seconds)
    pub forget_window_secs: i64,
    /// Reclaim attempts before a batch fails with `LostWorker`
    pub max_batch_retries: i64,
    /// Candidates read per claim; the surplus is cached
    pub prefetch: usize,
    /// Optional shared secret required in `X-API-Key`
    pub api_key: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            heartbeat_db_write_secs: 30,
            online_window_secs: 60,
            store_online_window_secs: 30,
            reclaim_window_secs: 90,
            sweep_interval_secs: 30,
            forget_window_secs: 3600,
            max_batch_retries: 3,
            prefetch: 5,
            api_key: None,
        }
    }
}

/// The coordinator: store + caches + heartbeat clock.
pub struct Dispatcher {
    store: Store,
    cache: DispatchCache,
    last_db_heartbeat: DashMap<String, Instant>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher over an open store.
    pub fn new(store: Store, config: DispatcherConfig) -> Self {
        Self {
            store,
            cache: DispatchCache::default(),
            last_db_heartbeat: DashMap::new(),
            config,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Dispatcher configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Cache statistics snapshot.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // --- submission -----------------------------------------------------

    /// Validate a submission, plan its batches, optionally translate the
    /// project copy, and insert everything in one transaction.
    pub async fn submit_job(&self, request: SubmitJobRequest) -> DispatchResult<Job> {
        let kind = RendererKind::from_name(&request.renderer)
            .ok_or_else(|| DispatchError::UnknownRenderer(request.renderer.clone()))?;

        let spans = plan_frame_range(&request.frame_range, request.batch_size)?;

        let mut job_data =
            serde_json::to_value(&request).unwrap_or_else(|_| Value::Object(Default::default()));

        if request.enable_path_translation && kind.supports_script_translation() {
            if let Some(processed) =
                paths::prepare_project_copy(Path::new(&request.file_path), &request.network_share)
            {
                if let Value::Object(map) = &mut job_data {
                    map.insert(
                        "processed_file_path".to_string(),
                        Value::String(processed.display().to_string()),
                    );
                }
            }
        }

        let new_job = NewJob {
            id: Uuid::new_v4().to_string(),
            title: request.title.clone(),
            renderer: kind.name().to_string(),
            priority: request.priority,
            job_data,
            batches: spans.iter().map(ToString::to_string).collect(),
        };

        let batches = new_job.batches.len();
        let job = self.store.insert_job(new_job).await?;
        info!(job_id = %job.id, title = %job.title, batches, "job submitted");
        Ok(job)
    }

    // --- worker lifecycle -----------------------------------------------

    /// Register (or re-register) a worker.
    pub async fn register_worker(
        &self,
        request: &RegisterRequest,
    ) -> DispatchResult<RegisterResponse> {
        self.store
            .upsert_worker(
                &request.worker_id,
                &request.ip_address,
                &request.hostname,
                &request.capabilities,
            )
            .await?;

        self.cache
            .touch_worker(&request.worker_id, WorkerPulse::bare());
        self.last_db_heartbeat
            .insert(request.worker_id.clone(), Instant::now());

        info!(
            worker_id = %request.worker_id,
            hostname = %request.hostname,
            ip = %request.ip_address,
            "worker registered"
        );

        Ok(RegisterResponse {
            status: "registered".to_string(),
            worker_id: request.worker_id.clone(),
        })
    }

    /// Record a worker heartbeat. The cache is always updated; the store
    /// row only when its last write is old enough, to cut I/O.
    pub async fn heartbeat(&self, request: &HeartbeatRequest) -> DispatchResult<HeartbeatResponse> {
        let known = self.cache.knows_worker(&request.worker_id)
            || self.store.worker_exists(&request.worker_id).await?;
        if !known {
            return Err(StoreError::NotFound(format!("worker {}", request.worker_id)).into());
        }

        self.cache.touch_worker(
            &request.worker_id,
            WorkerPulse {
                last_seen: Utc::now(),
                status: request.status.clone().unwrap_or_else(|| "idle".to_string()),
                system_metrics: request.system_metrics.clone(),
                current_jobs: request.current_jobs.clone(),
            },
        );

        let due = self
            .last_db_heartbeat
            .get(&request.worker_id)
            .map_or(true, |last| {
                last.elapsed().as_secs() >= self.config.heartbeat_db_write_secs
            });
        if due {
            self.store.touch_worker(&request.worker_id).await?;
            self.last_db_heartbeat
                .insert(request.worker_id.clone(), Instant::now());
        }

        Ok(HeartbeatResponse {
            status: "ok".to_string(),
            server_time: Utc::now(),
            cache_stats: self.cache.stats(),
        })
    }

    /// Mark a worker stopped.
    pub async fn stop_worker(&self, worker_id: &str) -> DispatchResult<()> {
        self.store.stop_worker(worker_id).await?;
        self.cache.remove_worker(worker_id);
        Ok(())
    }

    /// Remove a worker.
    pub async fn remove_worker(&self, worker_id: &str) -> DispatchResult<()> {
        self.store.remove_worker(worker_id).await?;
        self.cache.remove_worker(worker_id);
        self.last_db_heartbeat.remove(worker_id);
        Ok(())
    }

    /// All workers with derived online/offline status.
    pub async fn list_workers(&self) -> DispatchResult<Vec<WorkerRecord>> {
        Ok(self
            .store
            .list_workers(Duration::seconds(self.config.store_online_window_secs))
            .await?)
    }

    // --- scheduling -----------------------------------------------------

    /// Hand the next batch to a worker, or `None` when nothing is ready.
    ///
    /// Cached candidates are tried first and claimed through the store, so
    /// a stale entry can never be assigned twice. On a cache miss the
    /// store claim prefetches extra candidates into the cache.
    pub async fn next_for_worker(&self, worker_id: &str) -> DispatchResult<Option<ClaimedBatch>> {
        while let Some(candidate) = self.cache.pop_ready() {
            match self
                .store
                .claim_sub_job(&candidate.sub_job_id, worker_id)
                .await?
            {
                Some(claimed) => {
                    debug!(sub_job_id = %claimed.sub_job_id, worker_id, "cache-hit claim");
                    return Ok(Some(claimed));
                }
                // Taken or invalidated since it was prefetched; store wins.
                None => continue,
            }
        }

        let (claimed, rest) = self.store.claim_next(worker_id, self.config.prefetch).await?;
        if !rest.is_empty() {
            self.cache.push_ready(rest);
        }
        Ok(claimed)
    }

    /// Apply a completion report.
    pub async fn complete(&self, request: &CompleteRequest) -> DispatchResult<CompletionOutcome> {
        let outcome = self
            .store
            .complete_sub_job(
                &request.sub_job_id,
                &request.worker_id,
                request.success,
                request.error_message.as_deref(),
            )
            .await?;

        // Store committed; mirror into the cache.
        self.cache.invalidate_batch(&request.sub_job_id);

        if request.success {
            let render_time = request
                .metrics
                .as_ref()
                .and_then(|m| m.get("render_time"))
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            info!(
                sub_job_id = %request.sub_job_id,
                worker_id = %request.worker_id,
                render_time_secs = render_time,
                "batch completed"
            );
        } else {
            warn!(
                sub_job_id = %request.sub_job_id,
                worker_id = %request.worker_id,
                error = request.error_message.as_deref().unwrap_or("unknown"),
                "batch failed"
            );
        }

        Ok(outcome)
    }

    // --- job control ----------------------------------------------------

    /// All jobs, newest first.
    pub async fn list_jobs(&self) -> DispatchResult<Vec<Job>> {
        Ok(self.store.list_jobs().await?)
    }

    /// All batches of a job, including per-batch error messages.
    pub async fn list_batches(&self, job_id: &str) -> DispatchResult<Vec<SubJob>> {
        // Surface NotFound for an unknown job rather than an empty list.
        self.store.get_job(job_id).await?;
        Ok(self.store.list_sub_jobs(job_id).await?)
    }

    /// Pause one job.
    pub async fn pause_job(&self, job_id: &str) -> DispatchResult<()> {
        self.store.pause_job(job_id).await?;
        self.cache.clear_ready();
        Ok(())
    }

    /// Resume one job.
    pub async fn resume_job(&self, job_id: &str) -> DispatchResult<()> {
        Ok(self.store.resume_job(job_id).await?)
    }

    /// Cancel one job.
    pub async fn cancel_job(&self, job_id: &str) -> DispatchResult<()> {
        self.store.cancel_job(job_id).await?;
        self.cache.clear_ready();
        Ok(())
    }

    /// Pause everything.
    pub async fn pause_all(&self) -> DispatchResult<()> {
        self.store.pause_all().await?;
        self.cache.clear_ready();
        Ok(())
    }

    /// Resume everything.
    pub async fn resume_all(&self) -> DispatchResult<()> {
        Ok(self.store.resume_all().await?)
    }

    /// Purge completed jobs. Returns the number removed.
    pub async fn clear_completed(&self) -> DispatchResult<u64> {
        let removed = self.store.clear_completed().await?;
        self.cache.clear_ready();
        Ok(removed)
    }

    // --- status ---------------------------------------------------------

    /// Server status summary.
    pub async fn status(&self) -> DispatchResult<StatusResponse> {
        let cached_online = self
            .cache
            .online_count(Duration::seconds(self.config.online_window_secs))
            as i64;
        let online_workers = if cached_online > 0 {
            cached_online
        } else {
            self.store
                .count_online_workers(Duration::seconds(self.config.store_online_window_secs))
                .await?
        };

        Ok(StatusResponse {
            status: "online".to_string(),
            online_workers,
            total_jobs: self.store.count_jobs().await?,
            server_time: Utc::now(),
            cache_stats: self.cache.stats(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    // --- sweep hooks ----------------------------------------------------

    /// One sweep pass: reclaim batches from lost workers, evict stale
    /// cache entries, forget long-stopped workers. Called periodically by
    /// [`crate::dispatch::sweep::Sweeper`]; public so tests can drive it.
    pub async fn sweep_once(&self) -> DispatchResult<Vec<String>> {
        let reclaim_window = Duration::seconds(self.config.reclaim_window_secs);
        let fresh = self.cache.fresh_workers(reclaim_window);
        let cutoff = Utc::now() - reclaim_window;

        let reclaimed = self
            .store
            .reclaim_lost(cutoff, &fresh, self.config.max_batch_retries)
            .await?;

        let (stale_batches, stale_pulses) = self.cache.evict_stale();
        if stale_batches + stale_pulses > 0 {
            debug!(stale_batches, stale_pulses, "stale cache entries evicted");
        }

        let forgotten = self
            .store
            .forget_stopped_workers(Utc::now() - Duration::seconds(self.config.forget_window_secs))
            .await?;
        if forgotten > 0 {
            info!(forgotten, "stopped workers forgotten");
        }

        Ok(reclaimed)
    }
}
