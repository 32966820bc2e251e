// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! `render-farm worker`: run a render worker.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

use render_farm_core::config::ConfigLoader;
use render_farm_core::worker::{Worker, WorkerOptions};

/// Worker arguments
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Dispatcher URL, e.g. http://192.168.1.100:8080
    #[arg(long)]
    pub server: String,

    /// Worker id (derived from the hostname if not provided)
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Configuration file path
    #[arg(long, default_value = "worker_config.json")]
    pub config: PathBuf,
}

/// Run the worker until interrupted.
pub async fn execute(args: WorkerArgs) -> Result<()> {
    let config = ConfigLoader::new()
        .with_file(&args.config)
        .load()
        .context("failed to load worker configuration")?;

    let worker = Worker::new(WorkerOptions {
        server_url: args.server.clone(),
        worker_id: args.worker_id,
        config,
    })
    .await
    .context("failed to initialise worker")?;

    info!(server = %args.server, worker_id = worker.worker_id(), "starting worker");

    let handle = worker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            handle.shutdown();
        }
    });

    worker.start().await.context("worker failed")
}
