// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker-local performance helpers: the asset cache and the render
//! buffer pool.
//!
//! Both trade RAM for fewer cold reads and allocations. Neither is
//! correctness-critical: a cache miss reads the file, an exhausted pool
//! renders without a preallocated scratch buffer.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: usize = 1024 * 1024;

/// Asset cache statistics, reported in heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetCacheStats {
    /// Cache hits
    pub hit_count: u64,
    /// Cache misses
    pub miss_count: u64,
    /// Hit ratio in percent
    pub hit_ratio: f64,
    /// Cached files
    pub cached_files: usize,
    /// Bytes held
    pub cache_size_gb: f64,
    /// Bytes held relative to the budget, in percent
    pub cache_usage_percent: f64,
}

struct AssetCacheInner {
    entries: LruCache<PathBuf, Arc<Vec<u8>>>,
    current_bytes: u64,
    hit_count: u64,
    miss_count: u64,
}

/// Byte-budgeted LRU cache of project and asset files.
pub struct AssetCache {
    inner: Mutex<AssetCacheInner>,
    max_bytes: u64,
}

impl AssetCache {
    /// Cache with an explicit byte budget.
    pub fn with_capacity(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(AssetCacheInner {
                entries: LruCache::unbounded(),
                current_bytes: 0,
                hit_count: 0,
                miss_count: 0,
            }),
            max_bytes: max_bytes.max(1),
        }
    }

    /// Size the cache from installed memory: 30% up to 8 GB on standard
    /// machines, half of RAM up to 32 GB on machines with 32 GB or more.
    pub fn for_system(total_memory_gb: f64) -> Self {
        let budget_gb = if total_memory_gb >= 32.0 {
            (total_memory_gb * 0.5).min(32.0)
        } else {
            (total_memory_gb * 0.3).min(8.0)
        };
        Self::with_capacity((budget_gb * GIB as f64) as u64)
    }

    /// Fetch a file through the cache. Files larger than half the budget
    /// bypass the cache entirely.
    pub fn get_or_load(&self, path: &Path) -> std::io::Result<Arc<Vec<u8>>> {
        let cached = {
            let mut inner = self.inner.lock();
            let hit = inner.entries.get(path).cloned();
            if hit.is_some() {
                inner.hit_count += 1;
            }
            hit
        };
        if let Some(data) = cached {
            debug!(path = %path.display(), "asset cache hit");
            return Ok(data);
        }

        let data = Arc::new(std::fs::read(path)?);
        let size = data.len() as u64;

        let mut inner = self.inner.lock();
        inner.miss_count += 1;

        if size > self.max_bytes / 2 {
            warn!(path = %path.display(), size, "file too large for asset cache");
            return Ok(data);
        }

        while inner.current_bytes + size > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((evicted, bytes)) => {
                    inner.current_bytes -= bytes.len() as u64;
                    debug!(path = %evicted.display(), "asset evicted");
                }
                None => break,
            }
        }

        inner.entries.push(path.to_path_buf(), data.clone());
        inner.current_bytes += size;

        Ok(data)
    }

    /// Current statistics.
    pub fn stats(&self) -> AssetCacheStats {
        let inner = self.inner.lock();
        let requests = inner.hit_count + inner.miss_count;
        let hit_ratio = if requests > 0 {
            inner.hit_count as f64 / requests as f64 * 100.0
        } else {
            0.0
        };

        AssetCacheStats {
            hit_count: inner.hit_count,
            miss_count: inner.miss_count,
            hit_ratio,
            cached_files: inner.entries.len(),
            cache_size_gb: inner.current_bytes as f64 / GIB as f64,
            cache_usage_percent: inner.current_bytes as f64 / self.max_bytes as f64 * 100.0,
        }
    }
}

/// A borrowed scratch buffer. Opaque to the render; returned to the pool
/// when the batch finishes.
pub struct ScratchBuffer {
    bytes: Vec<u8>,
}

impl ScratchBuffer {
    fn new(size: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(size),
        }
    }

    /// Reserved capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }
}

struct BufferPoolInner {
    available: Vec<ScratchBuffer>,
    in_use: HashMap<String, ScratchBuffer>,
    created: usize,
}

/// Fixed-count pool of large render scratch buffers.
pub struct BufferPool {
    inner: Mutex<BufferPoolInner>,
    buffer_size: usize,
    max_buffers: usize,
}

impl BufferPool {
    /// Pool with explicit buffer size and count.
    pub fn new(buffer_size_mb: usize, max_buffers: usize) -> Self {
        Self {
            inner: Mutex::new(BufferPoolInner {
                available: Vec::new(),
                in_use: HashMap::new(),
                created: 0,
            }),
            buffer_size: buffer_size_mb * MIB,
            max_buffers,
        }
    }

    /// Size the pool from installed memory: 8 x 512 MB on standard
    /// machines, 16 x 2 GB on machines with 32 GB or more.
    pub fn for_system(total_memory_gb: f64) -> Self {
        if total_memory_gb >= 32.0 {
            Self::new(2048, 16)
        } else {
            Self::new(512, 8)
        }
    }

    /// Borrow a buffer for a batch. `None` when the pool is exhausted;
    /// the render proceeds without scratch space.
    pub fn borrow(&self, sub_job_id: &str) -> Option<usize> {
        let mut inner = self.inner.lock();

        let buffer = if let Some(buffer) = inner.available.pop() {
            buffer
        } else if inner.created < self.max_buffers {
            inner.created += 1;
            ScratchBuffer::new(self.buffer_size)
        } else {
            warn!(sub_job_id, "render buffer pool exhausted");
            return None;
        };

        let capacity = buffer.capacity();
        inner.in_use.insert(sub_job_id.to_string(), buffer);
        Some(capacity)
    }

    /// Return a batch's buffer. A no-op when it never borrowed one.
    pub fn give_back(&self, sub_job_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(buffer) = inner.in_use.remove(sub_job_id) {
            inner.available.push(buffer);
        }
    }

    /// (available, in use) counts.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.available.len(), inner.in_use.len())
    }
}
