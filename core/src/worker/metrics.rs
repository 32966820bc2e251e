// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! System metrics collection.
//!
//! Sampled for heartbeats, the local admission check and the periodic
//! metrics log.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{Disks, Networks, System};

use crate::config::ResourceLimits;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A snapshot of host load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Aggregate CPU usage percent
    pub cpu_percent: f64,
    /// Logical CPU count
    pub cpu_count: usize,
    /// Memory usage percent
    pub memory_percent: f64,
    /// Available memory in GB
    pub memory_available_gb: f64,
    /// Free disk space on the working volume in GB
    pub disk_free_gb: f64,
    /// Disk usage percent on the working volume
    pub disk_percent: f64,
    /// Total bytes sent since boot, summed over interfaces
    pub network_bytes_sent: u64,
    /// Total bytes received since boot, summed over interfaces
    pub network_bytes_recv: u64,
    /// Sample time
    pub timestamp: DateTime<Utc>,
}

impl SystemMetrics {
    /// Whether a new render may be admitted under the given limits.
    pub fn within_limits(&self, limits: &ResourceLimits) -> bool {
        self.memory_percent <= limits.max_memory_percent
            && self.cpu_percent <= limits.max_cpu_percent
            && self.disk_free_gb >= limits.min_free_disk_gb
    }
}

/// Reusable sysinfo handles. CPU usage needs successive refreshes of the
/// same `System` to produce deltas, hence the interior mutability.
pub struct MetricsCollector {
    sys: Mutex<System>,
    disks: Mutex<Disks>,
    networks: Mutex<Networks>,
}

impl MetricsCollector {
    /// Create a collector.
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }

    /// Take a fresh snapshot.
    pub fn collect(&self) -> SystemMetrics {
        let (cpu_percent, cpu_count, memory_percent, memory_available_gb) = {
            let mut sys = self.sys.lock();
            sys.refresh_cpu();
            sys.refresh_memory();

            let total = sys.total_memory() as f64;
            let available = sys.available_memory() as f64;
            let memory_percent = if total > 0.0 {
                (total - available) / total * 100.0
            } else {
                0.0
            };

            (
                f64::from(sys.global_cpu_info().cpu_usage()),
                sys.cpus().len().max(num_cpus::get()),
                memory_percent,
                available / GIB,
            )
        };

        let (disk_free_gb, disk_percent) = {
            let mut disks = self.disks.lock();
            disks.refresh();
            working_volume(&disks)
        };

        let (network_bytes_sent, network_bytes_recv) = {
            let mut networks = self.networks.lock();
            networks.refresh();
            networks.iter().fold((0u64, 0u64), |(sent, recv), (_, data)| {
                (
                    sent + data.total_transmitted(),
                    recv + data.total_received(),
                )
            })
        };

        SystemMetrics {
            cpu_percent,
            cpu_count,
            memory_percent,
            memory_available_gb,
            disk_free_gb,
            disk_percent,
            network_bytes_sent,
            network_bytes_recv,
            timestamp: Utc::now(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Free space and usage of the volume holding the working directory,
/// falling back to the most spacious disk.
fn working_volume(disks: &Disks) -> (f64, f64) {
    let cwd = std::env::current_dir().unwrap_or_else(|_| Path::new("/").to_path_buf());

    let best = disks
        .iter()
        .filter(|d| cwd.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .or_else(|| disks.iter().max_by_key(|d| d.available_space()));

    match best {
        Some(disk) => {
            let total = disk.total_space() as f64;
            let available = disk.available_space() as f64;
            let percent = if total > 0.0 {
                (total - available) / total * 100.0
            } else {
                0.0
            };
            (available / GIB, percent)
        }
        None => (0.0, 0.0),
    }
}

/// Total installed memory in GB.
pub fn total_memory_gb() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() as f64 / GIB
}

/// Host name, falling back to `"unknown"`.
pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}
