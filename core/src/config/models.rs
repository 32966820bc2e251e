// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration models.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Local admission limits checked before a worker pulls new work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Refuse new batches above this memory usage
    pub max_memory_percent: f64,
    /// Refuse new batches above this CPU usage
    pub max_cpu_percent: f64,
    /// Refuse new batches below this much free disk
    pub min_free_disk_gb: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_percent: 85.0,
            max_cpu_percent: 95.0,
            min_free_disk_gb: 5.0,
        }
    }
}

/// Per-renderer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererTuning {
    /// Multiplier applied to the per-frame timeout
    pub timeout_multiplier: f64,
    /// Expected memory footprint per concurrent render
    pub memory_per_job_gb: f64,
}

/// Worker process configuration.
///
/// Loaded from defaults, an optional JSON file (`worker_config.json` by
/// convention) and `RENDER_FARM_WORKER__*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Parallel render ceiling; 0 auto-sizes from the machine
    pub max_concurrent_jobs: usize,
    /// Heartbeat period (seconds)
    pub heartbeat_interval: u64,
    /// Metrics log period (seconds)
    pub metrics_interval: u64,
    /// Retries for registration and completion reports
    pub retry_attempts: u32,
    /// Render budget per frame (seconds)
    pub timeout_per_frame: u64,
    /// Scratch area for command files and partial output
    pub temp_directory: String,
    /// Worker log directory
    pub log_directory: String,
    /// Admission limits
    pub resource_limits: ResourceLimits,
    /// Optional shared secret sent as `X-API-Key`
    pub api_key: Option<String>,
    /// Per-renderer tuning, keyed by renderer name
    pub renderers: HashMap<String, RendererTuning>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let mut renderers = HashMap::new();
        renderers.insert(
            "nuke".to_string(),
            RendererTuning {
                timeout_multiplier: 1.0,
                memory_per_job_gb: 2.0,
            },
        );
        renderers.insert(
            "silhouette".to_string(),
            RendererTuning {
                timeout_multiplier: 1.5,
                memory_per_job_gb: 1.5,
            },
        );
        renderers.insert(
            "fusion".to_string(),
            RendererTuning {
                timeout_multiplier: 2.0,
                memory_per_job_gb: 3.0,
            },
        );

        Self {
            max_concurrent_jobs: 0,
            heartbeat_interval: 10,
            metrics_interval: 30,
            retry_attempts: 3,
            timeout_per_frame: 1800,
            temp_directory: "temp_renders".to_string(),
            log_directory: "logs".to_string(),
            resource_limits: ResourceLimits::default(),
            api_key: None,
            renderers,
        }
    }
}

impl WorkerConfig {
    /// Timeout multiplier for a renderer, defaulting to 1.0.
    pub fn timeout_multiplier(&self, renderer: &str) -> f64 {
        self.renderers
            .get(renderer)
            .map_or(1.0, |t| t.timeout_multiplier)
    }

    /// Expected memory per concurrent render for a renderer.
    pub fn memory_per_job_gb(&self, renderer: &str) -> f64 {
        self.renderers
            .get(renderer)
            .map_or(2.0, |t| t.memory_per_job_gb)
    }

    /// Resolve the concurrency ceiling.
    ///
    /// An explicit `max_concurrent_jobs` wins. Otherwise the machine is
    /// sized: `min(mem * 0.8 / mem_per_job, cpus * 0.75, 12)`, with the
    /// factors raised to 0.85 and the cap to 20 on machines with 32 GB or
    /// more. Never below 1.
    pub fn effective_max_jobs(&self, memory_gb: f64, cpu_count: usize) -> usize {
        if self.max_concurrent_jobs > 0 {
            return self.max_concurrent_jobs;
        }

        let mem_per_job = self.memory_per_job_gb("nuke");

        let (mem_factor, cpu_factor, cap) = if memory_gb >= 32.0 {
            (0.85, 0.85, 20)
        } else {
            (0.8, 0.75, 12)
        };

        let memory_limit = ((memory_gb * mem_factor) / mem_per_job).floor() as usize;
        let cpu_limit = (cpu_count as f64 * cpu_factor).floor() as usize;

        memory_limit.min(cpu_limit).min(cap).max(1)
    }
}
