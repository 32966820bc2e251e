// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The dispatcher's write-through in-memory cache.
//!
//! Two insertion-ordered bounded maps: prefetched pending batches and the
//! last-known heartbeat pulse per worker. The store is the source of
//! truth; every cached claim is re-validated through the store before it
//! is handed out, and on any inconsistency the store wins.

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroUsize;

use crate::store::ClaimedBatch;

/// Default bound for each cache map.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Default staleness timeout for cache entries.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 300;

/// A prefetched pending batch.
#[derive(Debug, Clone)]
struct CachedBatch {
    batch: ClaimedBatch,
    cached_at: DateTime<Utc>,
}

/// Last-known heartbeat state for a worker.
#[derive(Debug, Clone)]
pub struct WorkerPulse {
    /// When the pulse was received
    pub last_seen: DateTime<Utc>,
    /// Reported liveness status (`busy` / `idle`)
    pub status: String,
    /// Reported system metrics, verbatim
    pub system_metrics: Option<serde_json::Value>,
    /// Batches the worker says are in flight
    pub current_jobs: Vec<String>,
}

impl WorkerPulse {
    /// A pulse carrying nothing but the timestamp.
    pub fn bare() -> Self {
        Self {
            last_seen: Utc::now(),
            status: "idle".to_string(),
            system_metrics: None,
            current_jobs: Vec::new(),
        }
    }
}

/// Cache statistics, reported in `/status` and heartbeat responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Whether caching is active (always true at present)
    pub cache_enabled: bool,
    /// Prefetched pending batches
    pub ready_entries: usize,
    /// Workers with a cached pulse
    pub worker_entries: usize,
    /// Bound per map
    pub max_entries: usize,
    /// Staleness timeout in seconds
    pub stale_after_secs: i64,
}

/// Bounded ready/worker caches with staleness eviction.
pub struct DispatchCache {
    ready: Mutex<LruCache<String, CachedBatch>>,
    workers: Mutex<LruCache<String, WorkerPulse>>,
    max_entries: usize,
    stale_after: Duration,
}

impl DispatchCache {
    /// Create a cache with the given per-map bound and staleness timeout.
    pub fn new(max_entries: usize, stale_after: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("non-zero capacity");
        Self {
            ready: Mutex::new(LruCache::new(cap)),
            workers: Mutex::new(LruCache::new(cap)),
            max_entries,
            stale_after,
        }
    }

    // --- ready batches --------------------------------------------------

    /// Cache prefetched pending batches, oldest-priority first.
    pub fn push_ready(&self, batches: Vec<ClaimedBatch>) {
        let now = Utc::now();
        let mut ready = self.ready.lock();
        for batch in batches {
            ready.push(
                batch.sub_job_id.clone(),
                CachedBatch {
                    batch,
                    cached_at: now,
                },
            );
        }
    }

    /// Pop the oldest cached batch. The caller must claim it through the
    /// store before handing it to a worker.
    pub fn pop_ready(&self) -> Option<ClaimedBatch> {
        self.ready.lock().pop_lru().map(|(_, cached)| cached.batch)
    }

    /// Drop a batch from the ready cache (claimed, completed or
    /// invalidated elsewhere).
    pub fn invalidate_batch(&self, sub_job_id: &str) {
        self.ready.lock().pop(sub_job_id);
    }

    /// Drop every prefetched batch. Used when job state changes wholesale
    /// (pause/cancel/clear), where per-entry invalidation is not worth it.
    pub fn clear_ready(&self) {
        self.ready.lock().clear();
    }

    // --- worker pulses --------------------------------------------------

    /// Record a heartbeat pulse for a worker.
    pub fn touch_worker(&self, worker_id: &str, pulse: WorkerPulse) {
        self.workers.lock().push(worker_id.to_string(), pulse);
    }

    /// Whether the cache has any pulse for this worker.
    pub fn knows_worker(&self, worker_id: &str) -> bool {
        self.workers.lock().contains(worker_id)
    }

    /// Forget a worker's pulse.
    pub fn remove_worker(&self, worker_id: &str) {
        self.workers.lock().pop(worker_id);
    }

    /// Count workers whose pulse is within the window.
    pub fn online_count(&self, window: Duration) -> usize {
        let cutoff = Utc::now() - window;
        self.workers
            .lock()
            .iter()
            .filter(|(_, pulse)| pulse.last_seen > cutoff)
            .count()
    }

    /// Ids of workers whose pulse is within the window. The sweep uses
    /// this so a worker with a fresh pulse but a lagging store row is
    /// never reclaimed.
    pub fn fresh_workers(&self, window: Duration) -> HashSet<String> {
        let cutoff = Utc::now() - window;
        self.workers
            .lock()
            .iter()
            .filter(|(_, pulse)| pulse.last_seen > cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // --- maintenance ----------------------------------------------------

    /// Evict entries older than the staleness timeout. Returns the number
    /// of (batches, pulses) removed.
    pub fn evict_stale(&self) -> (usize, usize) {
        let cutoff = Utc::now() - self.stale_after;

        let mut ready = self.ready.lock();
        let stale_batches: Vec<String> = ready
            .iter()
            .filter(|(_, cached)| cached.cached_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale_batches {
            ready.pop(id);
        }
        drop(ready);

        let mut workers = self.workers.lock();
        let stale_workers: Vec<String> = workers
            .iter()
            .filter(|(_, pulse)| pulse.last_seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale_workers {
            workers.pop(id);
        }

        (stale_batches.len(), stale_workers.len())
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            cache_enabled: true,
            ready_entries: self.ready.lock().len(),
            worker_entries: self.workers.lock().len(),
            max_entries: self.max_entries,
            stale_after_secs: self.stale_after.num_seconds(),
        }
    }
}

impl Default for DispatchCache {
    fn default() -> Self {
        Self::new(
            DEFAULT_CACHE_CAPACITY,
            Duration::seconds(DEFAULT_STALE_AFTER_SECS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(id: &str) -> ClaimedBatch {
        ClaimedBatch {
            sub_job_id: id.to_string(),
            parent_job_id: "j1".to_string(),
            frame_range: "1-5".to_string(),
            job_data: json!({}),
        }
    }

    #[test]
    fn test_ready_cache_serves_in_insertion_order() {
        let cache = DispatchCache::default();
        cache.push_ready(vec![batch("a"), batch("b"), batch("c")]);

        assert_eq!(cache.pop_ready().unwrap().sub_job_id, "a");
        assert_eq!(cache.pop_ready().unwrap().sub_job_id, "b");
        cache.invalidate_batch("c");
        assert!(cache.pop_ready().is_none());
    }

    #[test]
    fn test_ready_cache_is_bounded() {
        let cache = DispatchCache::new(2, Duration::seconds(300));
        cache.push_ready(vec![batch("a"), batch("b"), batch("c")]);

        let stats = cache.stats();
        assert_eq!(stats.ready_entries, 2);
        // Oldest entry was evicted by the bound.
        assert_eq!(cache.pop_ready().unwrap().sub_job_id, "b");
    }

    #[test]
    fn test_worker_pulse_online_derivation() {
        let cache = DispatchCache::default();
        cache.touch_worker("w1", WorkerPulse::bare());

        let mut old = WorkerPulse::bare();
        old.last_seen = Utc::now() - Duration::seconds(120);
        cache.touch_worker("w2", old);

        assert_eq!(cache.online_count(Duration::seconds(60)), 1);
        let fresh = cache.fresh_workers(Duration::seconds(60));
        assert!(fresh.contains("w1"));
        assert!(!fresh.contains("w2"));
    }

    #[test]
    fn test_evict_stale() {
        let cache = DispatchCache::new(10, Duration::seconds(300));
        cache.push_ready(vec![batch("a")]);

        let mut old = WorkerPulse::bare();
        old.last_seen = Utc::now() - Duration::seconds(600);
        cache.touch_worker("w1", old);
        cache.touch_worker("w2", WorkerPulse::bare());

        let (batches, workers) = cache.evict_stale();
        assert_eq!(batches, 0);
        assert_eq!(workers, 1);
        assert!(cache.knows_worker("w2"));
        assert!(!cache.knows_worker("w1"));
    }
}
