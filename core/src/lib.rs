// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Render Farm Core
//!
//! A distributed render-farm coordinator for node-graph compositing
//! renderers. A central dispatcher accepts submitted frame-range jobs,
//! splits them into batches of contiguous frames, and hands those batches
//! to a fleet of worker processes that invoke the rendering executable
//! and report back with measured metrics.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Dispatcher                            │
//! │  ┌────────────────┐  ┌────────────────┐  ┌───────────────┐  │
//! │  │  HTTP API      │  │  Ready cache   │  │  Sweep task   │  │
//! │  │  (axum)        │  │  Worker cache  │  │  (reclaim)    │  │
//! │  └───────┬────────┘  └───────┬────────┘  └──────┬────────┘  │
//! │          └───────────────────┴──────────────────┘           │
//! │                          Store (SQLite)                     │
//! └───────────────────────────────┬─────────────────────────────┘
//!                                 │ register / heartbeat /
//!                                 │ pull / complete
//!          ┌──────────────────────┼──────────────────────┐
//!          ▼                      ▼                      ▼
//!  ┌───────────────┐      ┌───────────────┐      ┌───────────────┐
//!  │   Worker 1    │      │   Worker 2    │      │   Worker N    │
//!  │  renderer     │      │  renderer     │      │  renderer     │
//!  │  subprocesses │      │  subprocesses │      │  subprocesses │
//!  └───────────────┘      └───────────────┘      └───────────────┘
//! ```
//!
//! Batches are assigned at most once at any instant; a worker that stops
//! heartbeating has its running batches returned to the queue (bounded by
//! a retry budget), so the system delivers at-least-once execution with
//! idempotent completion.
//!
//! ## Starting a dispatcher
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use render_farm_core::api::{ApiConfig, ApiServer};
//! use render_farm_core::dispatch::{Dispatcher, DispatcherConfig};
//! use render_farm_core::store::Store;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Store::open(Path::new("render_farm.db")).await?;
//!     let dispatcher = Arc::new(Dispatcher::new(store, DispatcherConfig::default()));
//!     ApiServer::new(ApiConfig::default(), dispatcher).serve().await
//! }
//! ```
//!
//! ## Starting a worker
//!
//! ```rust,no_run
//! use render_farm_core::config::ConfigLoader;
//! use render_farm_core::worker::{Worker, WorkerOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::new().with_file("worker_config.json").load()?;
//!     let worker = Worker::new(WorkerOptions {
//!         server_url: "http://192.168.1.100:8080".to_string(),
//!         worker_id: None,
//!         config,
//!     })
//!     .await?;
//!     worker.start().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod dispatch;
pub mod store;
pub mod worker;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
