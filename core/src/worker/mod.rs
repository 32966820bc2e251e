// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Worker
//!
//! The render-machine side of the farm.
//!
//! ```text
//! ┌─────────────────────────── worker process ───────────────────────────┐
//! │ pull loop ──> admission check ──> /jobs/next ──> render task (xN)    │
//! │ heartbeat loop ──> /workers/heartbeat (metrics, in-flight batches)   │
//! │ metrics loop ──> periodic load logging                               │
//! │ cleanup loop ──> temp files, history ring                            │
//! │                                                                      │
//! │ render task: validate renderer ─> build command ─> spawn ─> supervise │
//! │              ─> detect outputs ─> /jobs/complete                     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The asset cache and render buffer pool are worker-local performance
//! aids; removing either changes no observable outcome.

pub mod assets;
pub mod capabilities;
pub mod client;
pub mod metrics;
pub mod output;
pub mod render;
pub mod renderers;
pub mod runtime;

use thiserror::Error;

pub use assets::{AssetCache, AssetCacheStats, BufferPool};
pub use capabilities::{Capabilities, DetectedRenderer};
pub use client::DispatcherClient;
pub use metrics::{MetricsCollector, SystemMetrics};
pub use output::OutputInfo;
pub use render::{run_render, RenderMetrics, RenderOutcome, RenderParams};
pub use renderers::{RenderCommand, RendererKind};
pub use runtime::{Worker, WorkerOptions};

/// Worker result type
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    /// HTTP transport failure talking to the dispatcher
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The dispatcher answered with an unexpected status
    #[error("{action} failed with HTTP {status}")]
    UnexpectedStatus {
        /// Which call failed
        action: &'static str,
        /// Received status code
        status: u16,
    },

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}
