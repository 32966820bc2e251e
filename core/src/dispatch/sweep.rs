// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Periodic maintenance sweep.
//!
//! Reclaims running batches from workers that stopped heartbeating,
//! evicts stale cache entries and forgets long-stopped workers. Lost-work
//! recovery is the only automatic retry path; explicit render failures
//! are terminal.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use crate::dispatch::dispatcher::Dispatcher;

/// Background sweep task over a shared dispatcher.
pub struct Sweeper {
    dispatcher: Arc<Dispatcher>,
    period: Duration,
}

impl Sweeper {
    /// Create a sweeper using the dispatcher's configured interval.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let period = Duration::from_secs(dispatcher.config().sweep_interval_secs.max(1));
        Self { dispatcher, period }
    }

    /// Run forever. Spawn this on the runtime next to the HTTP server.
    pub async fn run(self) {
        let mut ticker = interval(self.period);
        // The first tick fires immediately; skip it so a fresh dispatcher
        // does not reclaim before workers had a chance to heartbeat.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.dispatcher.sweep_once().await {
                Ok(reclaimed) if !reclaimed.is_empty() => {
                    info!(count = reclaimed.len(), "sweep reclaimed batches");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "sweep pass failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::dispatcher::DispatcherConfig;
    use crate::store::Store;

    #[tokio::test]
    async fn test_sweeper_period_from_config() {
        let store = Store::open_in_memory().await.unwrap();
        let config = DispatcherConfig {
            sweep_interval_secs: 7,
            ..DispatcherConfig::default()
        };
        let sweeper = Sweeper::new(Arc::new(Dispatcher::new(store, config)));
        assert_eq!(sweeper.period, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_sweeper_clamps_zero_period() {
        let store = Store::open_in_memory().await.unwrap();
        let config = DispatcherConfig {
            sweep_interval_secs: 0,
            ..DispatcherConfig::default()
        };
        let sweeper = Sweeper::new(Arc::new(Dispatcher::new(store, config)));
        assert_eq!(sweeper.period, Duration::from_secs(1));
    }
}
