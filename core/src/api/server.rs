// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The dispatcher's HTTP server.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::api::routes::router;
use crate::dispatch::{Dispatcher, Sweeper};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind host; empty or `0.0.0.0` binds all interfaces
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: crate::dispatch::DEFAULT_PORT,
        }
    }
}

/// HTTP server wrapping a dispatcher and its background sweep.
pub struct ApiServer {
    config: ApiConfig,
    dispatcher: Arc<Dispatcher>,
}

impl ApiServer {
    /// Create a server for a dispatcher.
    pub fn new(config: ApiConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self { config, dispatcher }
    }

    /// Bind, start the sweep task and serve until ctrl-c.
    pub async fn serve(self) -> Result<()> {
        let host = if self.config.host.is_empty() {
            "0.0.0.0"
        } else {
            self.config.host.as_str()
        };
        let addr = format!("{host}:{}", self.config.port);

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        tokio::spawn(Sweeper::new(self.dispatcher.clone()).run());

        info!(addr = %addr, "dispatcher listening");

        axum::serve(listener, router(self.dispatcher))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("server error")?;

        info!("dispatcher stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
    }
}
