// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker capability detection.
//!
//! Detected once at startup and refreshed only on explicit request:
//! platform, host resources and which renderer installations exist on
//! this machine. The resulting blob travels verbatim in the registration
//! payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::worker::metrics::{total_memory_gb, MetricsCollector};
use crate::worker::renderers::{ProbeSpec, RendererKind};

/// How long a `--version` probe may run.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Version strings are clipped to this many characters.
const VERSION_MAX_LEN: usize = 50;

/// A renderer installation found on this machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedRenderer {
    /// Executable path
    pub path: String,
    /// Short version string from `--version`, or `"unknown"`
    pub version: String,
    /// Whether the executable responded to the probe
    pub validated: bool,
}

/// Round-trip probe to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkProbe {
    /// Round-trip latency in milliseconds
    pub latency_ms: f64,
    /// `"ok"` or `"error"`
    pub status: String,
}

/// GPU summary, populated when detection is available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    /// Device count
    pub count: usize,
    /// Total GPU memory in GB
    pub memory_gb: f64,
    /// Device names
    pub names: Vec<String>,
}

/// Everything a worker reports about itself at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Operating system name
    pub platform: String,
    /// Host name
    pub hostname: String,
    /// Logical CPU count
    pub cpu_count: usize,
    /// Installed memory in GB
    pub memory_gb: f64,
    /// Free disk space in GB
    pub disk_space_gb: f64,
    /// Detected renderers by name
    pub renderers: HashMap<String, DetectedRenderer>,
    /// GPU info when detected
    pub gpu: Option<GpuInfo>,
    /// Dispatcher round-trip, measured after the client connects
    pub network: Option<NetworkProbe>,
    /// Resolved concurrency ceiling
    pub max_concurrent_jobs: usize,
}

impl Capabilities {
    /// Detect this machine's capabilities.
    pub async fn detect(config: &WorkerConfig) -> Self {
        let metrics = MetricsCollector::new().collect();
        let memory_gb = total_memory_gb();
        let cpu_count = num_cpus::get();

        let mut renderers = HashMap::new();
        for kind in RendererKind::ALL {
            if let Some(path) = probe_renderer(kind) {
                let version = renderer_version(&path).await;
                info!(renderer = kind.name(), path = %path.display(), version, "renderer detected");
                renderers.insert(
                    kind.name().to_string(),
                    DetectedRenderer {
                        path: path.display().to_string(),
                        version,
                        validated: true,
                    },
                );
            } else {
                debug!(renderer = kind.name(), "renderer not found");
            }
        }

        Self {
            platform: std::env::consts::OS.to_string(),
            hostname: crate::worker::metrics::hostname(),
            cpu_count,
            memory_gb,
            disk_space_gb: metrics.disk_free_gb,
            renderers,
            gpu: None,
            network: None,
            max_concurrent_jobs: config.effective_max_jobs(memory_gb, cpu_count),
        }
    }

    /// Whether a renderer was detected and validated.
    pub fn has_renderer(&self, name: &str) -> bool {
        self.renderers
            .get(name)
            .map_or(false, |r| r.validated)
    }

    /// Detected executable path for a renderer.
    pub fn renderer_path(&self, name: &str) -> Option<PathBuf> {
        self.renderers.get(name).map(|r| PathBuf::from(&r.path))
    }
}

/// Probe every known location for a renderer kind, preferring the newest
/// versioned install directory.
pub fn probe_renderer(kind: RendererKind) -> Option<PathBuf> {
    kind.probe_specs().iter().find_map(probe_location)
}

/// Scan one install location.
pub fn probe_location(spec: &ProbeSpec) -> Option<PathBuf> {
    let candidates: Vec<PathBuf> = match spec.dir_prefix {
        Some(prefix) => {
            let mut dirs: Vec<PathBuf> = entries_with_prefix(&spec.root, prefix)
                .into_iter()
                .filter(|p| p.is_dir())
                .collect();
            // Descending name order prefers the newest version.
            dirs.sort();
            dirs.reverse();
            dirs
        }
        None => vec![spec.root.clone()],
    };

    for dir in candidates {
        let search_dir = match spec.subdir {
            Some(subdir) => dir.join(subdir),
            None => dir,
        };

        let mut files: Vec<PathBuf> = entries_with_prefix(&search_dir, spec.file_prefix)
            .into_iter()
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        files.reverse();

        if let Some(found) = files.into_iter().next() {
            return Some(found);
        }
    }

    None
}

fn entries_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .filter_map(Result::ok)
        .filter(|e| {
            e.file_name()
                .to_str()
                .map_or(false, |name| name.starts_with(prefix))
        })
        .map(|e| e.path())
        .collect()
}

/// Capture a short version string from the executable.
async fn renderer_version(executable: &Path) -> String {
    let probe = Command::new(executable)
        .arg("--version")
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(VERSION_PROBE_TIMEOUT, probe).await {
        Ok(Ok(output)) => {
            let text = String::from_utf8_lossy(&output.stdout);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                "unknown".to_string()
            } else {
                trimmed.chars().take(VERSION_MAX_LEN).collect()
            }
        }
        _ => "unknown".to_string(),
    }
}
