// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! HTTP client for the dispatcher.
//!
//! Call timeouts: register 15 s, heartbeat 10 s, pull 15 s, complete
//! 15 s. Registration and completion reports retry with exponential
//! backoff (base 5 s, factor = attempt); transient network failures never
//! panic the worker.

use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::api::API_KEY_HEADER;
use crate::dispatch::{
    CompleteRequest, HeartbeatRequest, HeartbeatResponse, RegisterRequest, StatusResponse,
};
use crate::store::ClaimedBatch;
use crate::worker::WorkerError;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(15);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
const PULL_TIMEOUT: Duration = Duration::from_secs(15);
const COMPLETE_TIMEOUT: Duration = Duration::from_secs(15);
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Exponential backoff delay for the given 1-based attempt.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(5 * u64::from(attempt))
}

/// Client for one dispatcher.
pub struct DispatcherClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl DispatcherClient {
    /// Create a client for the given server URL.
    pub fn new(server_url: &str, api_key: Option<String>) -> Result<Self, WorkerError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(WorkerError::Http)?;

        Ok(Self {
            http,
            base_url: server_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    /// One registration attempt.
    pub async fn register(&self, payload: &RegisterRequest) -> Result<(), WorkerError> {
        let response = self
            .request(self.http.post(format!("{}/workers/register", self.base_url)))
            .timeout(REGISTER_TIMEOUT)
            .json(payload)
            .send()
            .await?;

        if response.status().is_success() {
            info!(worker_id = %payload.worker_id, "registered with dispatcher");
            Ok(())
        } else {
            Err(WorkerError::UnexpectedStatus {
                action: "register",
                status: response.status().as_u16(),
            })
        }
    }

    /// Register, retrying with exponential backoff.
    pub async fn register_with_backoff(
        &self,
        payload: &RegisterRequest,
        attempts: u32,
    ) -> Result<(), WorkerError> {
        let mut last_err = WorkerError::UnexpectedStatus {
            action: "register",
            status: 0,
        };

        for attempt in 1..=attempts.max(1) {
            match self.register(payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(attempt, error = %e, "registration attempt failed");
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Send a heartbeat.
    pub async fn heartbeat(
        &self,
        payload: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, WorkerError> {
        let response = self
            .request(self.http.post(format!("{}/workers/heartbeat", self.base_url)))
            .timeout(HEARTBEAT_TIMEOUT)
            .json(payload)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(WorkerError::UnexpectedStatus {
                action: "heartbeat",
                status: response.status().as_u16(),
            })
        }
    }

    /// Pull the next batch; `None` when the dispatcher has nothing ready.
    pub async fn next_job(&self, worker_id: &str) -> Result<Option<ClaimedBatch>, WorkerError> {
        let response = self
            .request(self.http.get(format!("{}/jobs/next", self.base_url)))
            .timeout(PULL_TIMEOUT)
            .query(&[("worker_id", worker_id)])
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(WorkerError::UnexpectedStatus {
                action: "pull",
                status: status.as_u16(),
            }),
        }
    }

    /// One completion-report attempt.
    pub async fn complete(&self, payload: &CompleteRequest) -> Result<(), WorkerError> {
        let response = self
            .request(self.http.post(format!("{}/jobs/complete", self.base_url)))
            .timeout(COMPLETE_TIMEOUT)
            .json(payload)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // The batch was reassigned while we rendered; the result is
            // dropped and must not be retried.
            StatusCode::CONFLICT => {
                warn!(sub_job_id = %payload.sub_job_id, "completion dropped, batch no longer ours");
                Ok(())
            }
            status => Err(WorkerError::UnexpectedStatus {
                action: "complete",
                status: status.as_u16(),
            }),
        }
    }

    /// Report completion, retrying transient failures with backoff.
    pub async fn complete_with_retry(
        &self,
        payload: &CompleteRequest,
        attempts: u32,
    ) -> Result<(), WorkerError> {
        let mut last_err = WorkerError::UnexpectedStatus {
            action: "complete",
            status: 0,
        };

        for attempt in 1..=attempts.max(1) {
            match self.complete(payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "completion report failed");
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    /// Round-trip latency to the dispatcher, in milliseconds.
    pub async fn measure_latency(&self) -> Option<f64> {
        let start = std::time::Instant::now();
        let response = self
            .request(self.http.get(format!("{}/status", self.base_url)))
            .timeout(STATUS_TIMEOUT)
            .send()
            .await
            .ok()?;

        let _body: StatusResponse = response.json().await.ok()?;
        let latency = start.elapsed().as_secs_f64() * 1000.0;
        debug!(latency_ms = latency, "dispatcher round trip measured");
        Some(latency)
    }
}
