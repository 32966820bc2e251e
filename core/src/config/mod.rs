// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration loading.
//!
//! Precedence, highest first:
//! 1. Environment variables (`RENDER_FARM_WORKER__*`, `__` separating
//!    nested keys, e.g. `RENDER_FARM_WORKER__RESOURCE_LIMITS__MIN_FREE_DISK_GB`)
//! 2. A JSON config file (`worker_config.json` by convention)
//! 3. Built-in defaults

pub mod models;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

pub use models::{RendererTuning, ResourceLimits, WorkerConfig};

/// Environment variable prefix for worker configuration overrides.
pub const ENV_PREFIX: &str = "RENDER_FARM_WORKER";

/// Separator for nested keys in environment overrides.
const ENV_SEPARATOR: &str = "__";

/// Worker configuration loader.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    skip_env: bool,
}

impl ConfigLoader {
    /// New loader with defaults only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from the given JSON file. A missing file is not an
    /// error; the worker then runs on defaults.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Ignore environment overrides. Used by tests.
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Resolve the final configuration.
    pub fn load(self) -> Result<WorkerConfig> {
        let defaults = Config::try_from(&WorkerConfig::default())
            .context("failed to serialise default configuration")?;

        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = &self.file {
            builder = builder.add_source(
                File::from(path.as_path())
                    .format(FileFormat::Json)
                    .required(false),
            );
        }

        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR),
            );
        }

        builder
            .build()
            .context("failed to assemble configuration")?
            .try_deserialize()
            .context("invalid worker configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_defaults_without_file() {
        let config = ConfigLoader::new().skip_env().load().unwrap();
        assert_eq!(config.heartbeat_interval, 10);
        assert_eq!(config.max_concurrent_jobs, 0);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ConfigLoader::new()
            .with_file("/nonexistent/worker_config.json")
            .skip_env()
            .load()
            .unwrap();
        assert_eq!(config.timeout_per_frame, 1800);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "max_concurrent_jobs": 4,
                "timeout_per_frame": 600,
                "resource_limits": {{
                    "max_memory_percent": 70.0,
                    "max_cpu_percent": 90.0,
                    "min_free_disk_gb": 10.0
                }}
            }}"#
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_file(file.path())
            .skip_env()
            .load()
            .unwrap();

        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.timeout_per_frame, 600);
        assert!((config.resource_limits.min_free_disk_gb - 10.0).abs() < f64::EPSILON);
        // Untouched keys keep their defaults.
        assert_eq!(config.heartbeat_interval, 10);
        assert!((config.timeout_multiplier("silhouette") - 1.5).abs() < f64::EPSILON);
    }
}
