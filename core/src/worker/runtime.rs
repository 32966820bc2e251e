// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The worker runtime.
//!
//! A long-running process that registers with the dispatcher, heartbeats
//! with live system metrics, pulls batches while the local admission
//! check passes, and supervises one renderer subprocess per batch up to
//! the concurrency ceiling. Heartbeat, metrics and cleanup loops run
//! independently of the renders.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::dispatch::{CompleteRequest, HeartbeatRequest, RegisterRequest};
use crate::store::ClaimedBatch;
use crate::worker::assets::{AssetCache, BufferPool};
use crate::worker::capabilities::{Capabilities, NetworkProbe};
use crate::worker::client::DispatcherClient;
use crate::worker::metrics::{total_memory_gb, MetricsCollector};
use crate::worker::render::{run_render, RenderParams};
use crate::worker::renderers::RendererKind;
use crate::worker::WorkerResult;

/// Consecutive pull failures before the worker gives up.
const MAX_PULL_FAILURES: u32 = 10;

/// Consecutive heartbeat failures before re-registration is attempted.
const MAX_HEARTBEAT_FAILURES: u32 = 6;

/// Temp files older than this are deleted by the cleanup loop.
const TEMP_FILE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Cleanup loop period.
const CLEANUP_PERIOD: Duration = Duration::from_secs(3600);

/// Render history ring size.
const HISTORY_LIMIT: usize = 100;

/// Drain budget on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(300);

/// Options for constructing a worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Dispatcher base URL
    pub server_url: String,
    /// Worker id; derived from the hostname when absent
    pub worker_id: Option<String>,
    /// Loaded configuration
    pub config: WorkerConfig,
}

/// One in-flight render.
#[derive(Debug, Clone)]
struct InFlightRender {
    frame_range: String,
    started: DateTime<Utc>,
}

/// One line of render history, kept in a bounded ring.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Batch id
    pub sub_job_id: String,
    /// Whether it succeeded
    pub success: bool,
    /// Wall time in seconds
    pub duration_secs: f64,
    /// Completion time
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RenderStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    frames_rendered: AtomicU64,
    render_millis: AtomicU64,
}

/// The worker process state.
pub struct Worker {
    worker_id: String,
    ip_address: String,
    config: WorkerConfig,
    client: DispatcherClient,
    capabilities: RwLock<Capabilities>,
    metrics: MetricsCollector,
    assets: Arc<AssetCache>,
    buffers: Arc<BufferPool>,
    current: DashMap<String, InFlightRender>,
    history: Mutex<VecDeque<HistoryEntry>>,
    stats: RenderStats,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    max_jobs: usize,
    big_machine: bool,
    temp_dir: PathBuf,
}

impl Worker {
    /// Detect capabilities and build a worker. Fails only on an invalid
    /// server URL; a missing renderer is reported per batch instead.
    pub async fn new(options: WorkerOptions) -> WorkerResult<Arc<Self>> {
        let capabilities = Capabilities::detect(&options.config).await;
        let worker_id = options
            .worker_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("worker_{}", capabilities.hostname));

        let client = DispatcherClient::new(&options.server_url, options.config.api_key.clone())?;

        let memory_gb = total_memory_gb();
        let big_machine = memory_gb >= 32.0;
        let max_jobs = capabilities.max_concurrent_jobs.max(1);

        let temp_dir = PathBuf::from(&options.config.temp_directory);
        std::fs::create_dir_all(&temp_dir)?;
        std::fs::create_dir_all(&options.config.log_directory)?;

        info!(
            worker_id,
            max_jobs,
            big_machine,
            renderers = capabilities.renderers.len(),
            "worker initialised"
        );

        Ok(Arc::new(Self {
            worker_id,
            ip_address: local_ip(),
            config: options.config,
            client,
            capabilities: RwLock::new(capabilities),
            metrics: MetricsCollector::new(),
            assets: Arc::new(AssetCache::for_system(memory_gb)),
            buffers: Arc::new(BufferPool::for_system(memory_gb)),
            current: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            stats: RenderStats::default(),
            semaphore: Arc::new(Semaphore::new(max_jobs)),
            running: AtomicBool::new(false),
            max_jobs,
            big_machine,
            temp_dir,
        }))
    }

    /// This worker's id.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Register and run until shutdown.
    pub async fn start(self: Arc<Self>) -> WorkerResult<()> {
        // Measure the dispatcher round trip before registering so the
        // capabilities blob carries it.
        if let Some(latency_ms) = self.client.measure_latency().await {
            self.capabilities.write().network = Some(NetworkProbe {
                latency_ms,
                status: "ok".to_string(),
            });
        }

        self.client
            .register_with_backoff(&self.register_payload(), self.config.retry_attempts)
            .await?;

        self.running.store(true, Ordering::SeqCst);

        let worker = self.clone();
        tokio::spawn(async move { worker.heartbeat_loop().await });
        let worker = self.clone();
        tokio::spawn(async move { worker.metrics_loop().await });
        let worker = self.clone();
        tokio::spawn(async move { worker.cleanup_loop().await });

        info!(worker_id = %self.worker_id, "worker online");
        self.clone().pull_loop().await;

        self.drain().await;
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    /// Ask the worker to stop pulling and drain.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // --- loops ----------------------------------------------------------

    async fn pull_loop(self: Arc<Self>) {
        let mut consecutive_failures = 0u32;

        while self.running.load(Ordering::SeqCst) {
            if self.current.len() >= self.max_jobs || !self.admission_ok() {
                tokio::time::sleep(self.poll_interval(true)).await;
                continue;
            }

            match self.client.next_job(&self.worker_id).await {
                Ok(Some(batch)) => {
                    consecutive_failures = 0;
                    let worker = self.clone();
                    tokio::spawn(async move { worker.execute_batch(batch).await });
                    tokio::time::sleep(self.poll_interval(true)).await;
                }
                Ok(None) => {
                    consecutive_failures = 0;
                    tokio::time::sleep(self.poll_interval(false)).await;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(
                        error = %e,
                        consecutive_failures,
                        "failed to pull work"
                    );
                    if consecutive_failures >= MAX_PULL_FAILURES {
                        error!("too many consecutive failures, shutting down");
                        self.shutdown();
                        break;
                    }
                    let delay = Duration::from_secs(u64::from(consecutive_failures) * 10).min(
                        Duration::from_secs(60),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.heartbeat_interval.max(1)));
        let mut consecutive_failures = 0u32;

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;

            // Host metrics plus the asset cache counters ride together.
            let system_metrics = serde_json::to_value(self.metrics.collect())
                .ok()
                .map(|mut metrics| {
                    if let (serde_json::Value::Object(map), Ok(cache)) =
                        (&mut metrics, serde_json::to_value(self.assets.stats()))
                    {
                        map.insert("asset_cache".to_string(), cache);
                    }
                    metrics
                });

            let payload = HeartbeatRequest {
                worker_id: self.worker_id.clone(),
                system_metrics,
                current_jobs: self.current.iter().map(|e| e.key().clone()).collect(),
                status: Some(if self.current.is_empty() {
                    "idle".to_string()
                } else {
                    "busy".to_string()
                }),
            };

            match self.client.heartbeat(&payload).await {
                Ok(_) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(error = %e, consecutive_failures, "heartbeat failed");

                    if consecutive_failures >= MAX_HEARTBEAT_FAILURES {
                        error!("lost dispatcher, attempting re-registration");
                        match self
                            .client
                            .register_with_backoff(
                                &self.register_payload(),
                                self.config.retry_attempts,
                            )
                            .await
                        {
                            Ok(()) => consecutive_failures = 0,
                            Err(e) => {
                                error!(error = %e, "re-registration failed, shutting down");
                                self.shutdown();
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn metrics_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.metrics_interval.max(1)));

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            let snapshot = self.metrics.collect();
            debug!(
                cpu_percent = snapshot.cpu_percent,
                memory_percent = snapshot.memory_percent,
                disk_free_gb = snapshot.disk_free_gb,
                in_flight = self.current.len(),
                "system metrics"
            );
            for entry in self.current.iter() {
                let elapsed = (Utc::now() - entry.value().started).num_seconds();
                debug!(
                    sub_job_id = %entry.key(),
                    frames = %entry.value().frame_range,
                    elapsed_secs = elapsed,
                    "render in flight"
                );
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut ticker = interval(CLEANUP_PERIOD);

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            let removed = clean_temp_files(&self.temp_dir, TEMP_FILE_MAX_AGE);
            if removed > 0 {
                info!(removed, "old temp files removed");
            }

            let mut history = self.history.lock();
            while history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    // --- execution ------------------------------------------------------

    async fn execute_batch(self: Arc<Self>, batch: ClaimedBatch) {
        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };

        let sub_job_id = batch.sub_job_id.clone();
        self.current.insert(
            sub_job_id.clone(),
            InFlightRender {
                frame_range: batch.frame_range.clone(),
                started: Utc::now(),
            },
        );

        let buffer = self.buffers.borrow(&sub_job_id);
        if buffer.is_none() {
            debug!(sub_job_id, "rendering without a preallocated buffer");
        }

        let outcome = self.render_batch(&batch).await;

        let report = CompleteRequest {
            sub_job_id: sub_job_id.clone(),
            worker_id: self.worker_id.clone(),
            success: outcome.success,
            error_message: outcome.error.clone(),
            metrics: serde_json::to_value(&outcome.metrics).ok(),
        };
        if let Err(e) = self
            .client
            .complete_with_retry(&report, self.config.retry_attempts)
            .await
        {
            error!(sub_job_id, error = %e, "failed to report completion");
        }

        self.record_outcome(&sub_job_id, outcome.success, outcome.metrics.render_time);
        if outcome.success {
            self.stats
                .frames_rendered
                .fetch_add(outcome.metrics.frames_rendered.max(0) as u64, Ordering::Relaxed);
        }

        self.buffers.give_back(&sub_job_id);
        self.current.remove(&sub_job_id);
        drop(permit);
    }

    async fn render_batch(&self, batch: &ClaimedBatch) -> crate::worker::render::RenderOutcome {
        use crate::worker::render::RenderOutcome;

        let fail = |reason: String| RenderOutcome {
            success: false,
            error: Some(reason),
            metrics: Default::default(),
        };

        let renderer_name = batch
            .job_data
            .get("renderer")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let Some(kind) = RendererKind::from_name(&renderer_name) else {
            return fail(format!("RendererUnavailable: unknown renderer {renderer_name:?}"));
        };

        if !self.capabilities.read().has_renderer(kind.name()) {
            return fail(format!(
                "RendererUnavailable: {} not detected on worker {}",
                kind.name(),
                self.worker_id
            ));
        }

        let span = match crate::dispatch::FrameSpan::parse(&batch.frame_range) {
            Ok(span) => span,
            Err(e) => return fail(format!("malformed batch frame range: {e}")),
        };

        // The dispatcher may have produced a path-translated copy.
        let project = batch
            .job_data
            .get("processed_file_path")
            .or_else(|| batch.job_data.get("file_path"))
            .and_then(|v| v.as_str())
            .map(PathBuf::from);
        let Some(project) = project else {
            return fail("batch carries no project file path".to_string());
        };

        let executable = batch
            .job_data
            .get("executable_path")
            .and_then(|v| v.as_str())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.capabilities.read().renderer_path(kind.name()));
        let Some(executable) = executable else {
            return fail(format!(
                "RendererUnavailable: no executable for {}",
                kind.name()
            ));
        };

        let extra_args = batch
            .job_data
            .get("extra_args")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Warm the asset cache with the project file.
        let assets = self.assets.clone();
        let preload = project.clone();
        let _ = tokio::task::spawn_blocking(move || assets.get_or_load(&preload)).await;

        let params = RenderParams {
            sub_job_id: batch.sub_job_id.clone(),
            kind,
            executable,
            project,
            span,
            extra_args,
            timeout_per_frame: self.config.timeout_per_frame,
            timeout_multiplier: self.config.timeout_multiplier(kind.name()),
        };

        let mut outcome = run_render(&params).await;
        outcome.metrics.cache_stats = Some(self.assets.stats());
        outcome
    }

    // --- bookkeeping ----------------------------------------------------

    fn register_payload(&self) -> RegisterRequest {
        let capabilities = self.capabilities.read();
        RegisterRequest {
            worker_id: self.worker_id.clone(),
            ip_address: self.ip_address.clone(),
            hostname: capabilities.hostname.clone(),
            capabilities: serde_json::to_value(&*capabilities).unwrap_or_else(|_| json!({})),
        }
    }

    fn admission_ok(&self) -> bool {
        let snapshot = self.metrics.collect();
        let ok = snapshot.within_limits(&self.config.resource_limits);
        if !ok {
            warn!(
                cpu_percent = snapshot.cpu_percent,
                memory_percent = snapshot.memory_percent,
                disk_free_gb = snapshot.disk_free_gb,
                "resources low, not requesting new batches"
            );
        }
        ok
    }

    /// Poll interval, adapted to machine size. Larger machines poll
    /// faster; an idle worker backs off further.
    fn poll_interval(&self, busy: bool) -> Duration {
        let secs = match (busy, self.big_machine) {
            (true, true) => 5,
            (true, false) => 10,
            (false, true) => 15,
            (false, false) => 30,
        };
        Duration::from_secs(secs)
    }

    fn record_outcome(&self, sub_job_id: &str, success: bool, duration_secs: f64) {
        if success {
            self.stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .render_millis
            .fetch_add((duration_secs * 1000.0) as u64, Ordering::Relaxed);

        let mut history = self.history.lock();
        history.push_back(HistoryEntry {
            sub_job_id: sub_job_id.to_string(),
            success,
            duration_secs,
            finished_at: Utc::now(),
        });
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    /// Completed render history, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    /// (completed, failed, frames) counters.
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.jobs_completed.load(Ordering::Relaxed),
            self.stats.jobs_failed.load(Ordering::Relaxed),
            self.stats.frames_rendered.load(Ordering::Relaxed),
        )
    }

    async fn drain(&self) {
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while !self.current.is_empty() {
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.current.len(),
                    "shutdown timeout reached with renders still in flight"
                );
                break;
            }
            info!(remaining = self.current.len(), "waiting for renders to finish");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

/// Best-effort local IP discovery via a routed UDP socket. No packets are
/// sent.
fn local_ip() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Delete files under `dir` older than `max_age`. Returns how many went.
fn clean_temp_files(dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let old = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .map_or(false, |age| age > max_age);
        if old && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_worker() -> Arc<Worker> {
        let dir = TempDir::new().unwrap();
        let config = WorkerConfig {
            max_concurrent_jobs: 2,
            temp_directory: dir.path().join("tmp").display().to_string(),
            log_directory: dir.path().join("logs").display().to_string(),
            ..WorkerConfig::default()
        };
        // Leak the tempdir so the directories survive the constructor.
        std::mem::forget(dir);

        Worker::new(WorkerOptions {
            server_url: "http://127.0.0.1:9".to_string(),
            worker_id: Some("w-test".to_string()),
            config,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_worker_id_defaults_to_hostname() {
        let dir = TempDir::new().unwrap();
        let config = WorkerConfig {
            temp_directory: dir.path().join("tmp").display().to_string(),
            log_directory: dir.path().join("logs").display().to_string(),
            ..WorkerConfig::default()
        };

        let worker = Worker::new(WorkerOptions {
            server_url: "http://127.0.0.1:9".to_string(),
            worker_id: None,
            config,
        })
        .await
        .unwrap();

        assert!(worker.worker_id().starts_with("worker_"));
    }

    #[tokio::test]
    async fn test_poll_interval_adapts() {
        let worker = test_worker().await;
        // Intervals depend on detected memory, but the busy interval is
        // always the shorter one and both sit in the 5-30s band.
        let busy = worker.poll_interval(true);
        let idle = worker.poll_interval(false);
        assert!(busy < idle);
        assert!(busy >= Duration::from_secs(5));
        assert!(idle <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_history_ring_is_bounded() {
        let worker = test_worker().await;
        for i in 0..150 {
            worker.record_outcome(&format!("b{i}"), i % 2 == 0, 1.0);
        }

        let history = worker.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last().unwrap().sub_job_id, "b149");

        let (completed, failed, _) = worker.stats();
        assert_eq!(completed + failed, 150);
    }

    #[tokio::test]
    async fn test_register_payload_carries_capabilities() {
        let worker = test_worker().await;
        let payload = worker.register_payload();

        assert_eq!(payload.worker_id, "w-test");
        assert!(!payload.ip_address.is_empty());
        assert!(payload.capabilities.get("cpu_count").is_some());
        assert!(payload.capabilities.get("platform").is_some());
    }

    #[tokio::test]
    async fn test_render_batch_rejects_unknown_renderer() {
        let worker = test_worker().await;
        let batch = ClaimedBatch {
            sub_job_id: "j1_batch_001".to_string(),
            parent_job_id: "j1".to_string(),
            frame_range: "1-2".to_string(),
            job_data: json!({"renderer": "blender", "file_path": "/x.blend"}),
        };

        let outcome = worker.render_batch(&batch).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("RendererUnavailable"));
    }

    #[test]
    fn test_local_ip_is_parseable() {
        let ip = local_ip();
        assert!(ip.parse::<std::net::IpAddr>().is_ok());
    }

    #[test]
    fn test_clean_temp_files_ignores_fresh() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("fresh.cmd"), b"x").unwrap();

        let removed = clean_temp_files(dir.path(), Duration::from_secs(3600));
        assert_eq!(removed, 0);
        assert!(dir.path().join("fresh.cmd").exists());
    }
}
