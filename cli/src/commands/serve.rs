// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! `render-farm serve`: run the dispatcher.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use render_farm_core::api::{ApiConfig, ApiServer};
use render_farm_core::dispatch::{Dispatcher, DispatcherConfig, DEFAULT_PORT};
use render_farm_core::store::{Store, DEFAULT_STORE_FILE};

/// Dispatcher arguments
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Host to bind (default: all interfaces)
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Store file path
    #[arg(long, default_value = DEFAULT_STORE_FILE)]
    pub db: PathBuf,

    /// Shared secret required in X-API-Key from workers and UIs
    #[arg(long, env = "RENDER_FARM_API_KEY")]
    pub api_key: Option<String>,
}

/// Run the dispatcher until interrupted.
pub async fn execute(args: ServeArgs) -> Result<()> {
    let store = Store::open(&args.db)
        .await
        .with_context(|| format!("failed to open store at {}", args.db.display()))?;

    let dispatcher_config = DispatcherConfig {
        api_key: args.api_key,
        ..DispatcherConfig::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(store, dispatcher_config));

    info!(
        port = args.port,
        host = %args.host,
        db = %args.db.display(),
        "starting dispatcher"
    );

    ApiServer::new(
        ApiConfig {
            host: args.host,
            port: args.port,
        },
        dispatcher,
    )
    .serve()
    .await
}
