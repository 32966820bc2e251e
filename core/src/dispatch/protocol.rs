// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Wire protocol between the dispatcher and its callers.
//!
//! JSON bodies for worker registration, heartbeats, completion reports and
//! job submission. The batch descriptor handed out by `/jobs/next` is
//! [`crate::store::ClaimedBatch`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::cache::CacheStats;
use crate::store::Priority;

/// Register worker request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Worker id (operator-supplied or hostname-derived)
    pub worker_id: String,
    /// Worker IP address
    pub ip_address: String,
    /// Worker hostname
    pub hostname: String,
    /// Capabilities blob (platform, cpu count, memory, detected renderers, ...)
    pub capabilities: serde_json::Value,
}

/// Register worker response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Always `"registered"`
    pub status: String,
    /// Echoed worker id
    pub worker_id: String,
}

/// Heartbeat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Worker id
    pub worker_id: String,
    /// Current system metrics, passed through verbatim
    #[serde(default)]
    pub system_metrics: Option<serde_json::Value>,
    /// Batch ids currently in flight on the worker
    #[serde(default)]
    pub current_jobs: Vec<String>,
    /// Liveness status (`busy` / `idle`)
    #[serde(default)]
    pub status: Option<String>,
}

/// Heartbeat response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Always `"ok"`
    pub status: String,
    /// Dispatcher clock
    pub server_time: DateTime<Utc>,
    /// Dispatcher cache statistics
    pub cache_stats: CacheStats,
}

/// Batch completion report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteRequest {
    /// Batch id
    pub sub_job_id: String,
    /// Reporting worker id
    pub worker_id: String,
    /// Whether the render succeeded
    pub success: bool,
    /// Failure reason, when unsuccessful
    #[serde(default)]
    pub error_message: Option<String>,
    /// Measured metrics (render_time, frames_rendered, output_info, ...)
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
}

/// Batch completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResponse {
    /// Always `"updated"`
    pub status: String,
}

/// Job submission payload.
///
/// Beyond the interpreted fields, arbitrary key-value pairs are carried
/// opaquely in `extra` and surfaced verbatim in the batch descriptor a
/// worker receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    /// Job title
    pub title: String,
    /// Renderer kind name
    pub renderer: String,
    /// Renderer executable path on the workers
    #[serde(default)]
    pub executable_path: String,
    /// Project file path
    pub file_path: String,
    /// Frame-range expression, e.g. `"1-100"` or `"1-20,22,35"`
    pub frame_range: String,
    /// Frames per batch
    pub batch_size: i64,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,
    /// Extra renderer command-line arguments
    #[serde(default)]
    pub extra_args: String,
    /// Rewrite local drive paths to the network share before dispatch
    #[serde(default)]
    pub enable_path_translation: bool,
    /// Network share used by path translation
    #[serde(default)]
    pub network_share: String,
    /// Dispatch to all workers (advisory; uninterpreted by the core)
    #[serde(default)]
    pub all_workers: bool,
    /// Restrict to a named worker pool (advisory; uninterpreted)
    #[serde(default)]
    pub specific_pool: String,
    /// Free-form fields passed through to workers opaquely
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Job submission response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// Always `"submitted"`
    pub status: String,
    /// Assigned job id
    pub job_id: String,
}

/// `/status` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Always `"online"`
    pub status: String,
    /// Workers heartbeating within the online window
    pub online_workers: i64,
    /// Total jobs in the store
    pub total_jobs: i64,
    /// Dispatcher clock
    pub server_time: DateTime<Utc>,
    /// Dispatcher cache statistics
    pub cache_stats: CacheStats,
    /// Crate version
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_submit_request_carries_unknown_fields() {
        let payload = json!({
            "title": "shot_010",
            "renderer": "nuke",
            "file_path": "/mnt/projects/shot_010.nk",
            "frame_range": "1-100",
            "batch_size": 10,
            "priority": "high",
            "queue_server": "render-01:8080",
            "shared_storage": "//nas/projects"
        });

        let req: SubmitJobRequest = serde_json::from_value(payload).unwrap();
        assert_eq!(req.priority, Priority::High);
        assert_eq!(
            req.extra.get("queue_server").and_then(|v| v.as_str()),
            Some("render-01:8080")
        );

        // The opaque fields survive a round trip into the stored payload.
        let round = serde_json::to_value(&req).unwrap();
        assert_eq!(
            round.get("shared_storage").and_then(|v| v.as_str()),
            Some("//nas/projects")
        );
    }

    #[test]
    fn test_submit_request_defaults() {
        let req: SubmitJobRequest = serde_json::from_value(json!({
            "title": "t",
            "renderer": "fusion",
            "file_path": "a.comp",
            "frame_range": "1",
            "batch_size": 1
        }))
        .unwrap();

        assert_eq!(req.priority, Priority::Normal);
        assert!(!req.enable_path_translation);
        assert!(req.extra_args.is_empty());
    }

    #[test]
    fn test_heartbeat_request_minimal() {
        let req: HeartbeatRequest = serde_json::from_value(json!({"worker_id": "w1"})).unwrap();
        assert_eq!(req.worker_id, "w1");
        assert!(req.current_jobs.is_empty());
        assert!(req.system_metrics.is_none());
    }
}
