// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Store models: jobs, sub-jobs (batches) and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;

/// Job priority, strictly ordered: critical > high > normal > low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Priority {
    /// Ahead of everything else
    Critical,
    /// Ahead of normal work
    High,
    /// Default priority
    Normal,
    /// Behind everything else
    Low,
}

impl Priority {
    /// Rank used for ordering; lower runs first.
    pub fn rank(self) -> i64 {
        match self {
            Self::Critical => 1,
            Self::High => 2,
            Self::Normal => 3,
            Self::Low => 4,
        }
    }

    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, no batch claimed yet
    Pending,
    /// At least one batch claimed
    Running,
    /// Paused by the operator
    Paused,
    /// Cancelled by the operator
    Cancelled,
    /// Every batch completed
    Completed,
    /// All batches terminal, at least one failed
    Failed,
}

impl JobStatus {
    /// Terminal statuses are never mutated again except via explicit clear.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Batch (sub-job) status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SubJobStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a worker
    Running,
    /// Paused by the operator
    Paused,
    /// Cancelled by the operator
    Cancelled,
    /// Reported successful
    Completed,
    /// Reported failed, or lost past the retry limit
    Failed,
}

impl SubJobStatus {
    /// Whether this batch reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SubJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Stored worker status. The stored column is advisory; the list queries
/// derive online/offline from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Heartbeating within the online window
    Online,
    /// Heartbeat expired
    Offline,
    /// Explicitly stopped by the operator
    Stopped,
}

/// A render job over a frame range.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// Opaque identifier (UUID v4)
    pub id: String,
    /// Human-readable title
    pub title: String,
    /// Renderer kind name
    pub renderer: String,
    /// Current status
    pub status: JobStatus,
    /// Fraction of batches completed, in [0, 1]
    pub progress: f64,
    /// Scheduling priority
    pub priority: Priority,
    /// Original submission payload, passed through to workers verbatim
    pub job_data: Json<serde_json::Value>,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// First claim time
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time
    pub completed_at: Option<DateTime<Utc>>,
    /// Error summary, if any
    pub error_message: Option<String>,
}

/// A unit of work rendering a contiguous run of frames.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubJob {
    /// Stable sortable identifier: `<jobId>_batch_NNN`
    pub id: String,
    /// Parent job id
    pub parent_job_id: String,
    /// Dense 1-based index within the job
    pub batch_number: i64,
    /// Contiguous frame run, `"start-end"` or a single frame
    pub frame_range: String,
    /// Current status
    pub status: SubJobStatus,
    /// Assigned worker while running
    pub worker_id: Option<String>,
    /// Claim time
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason, if any
    pub error_message: Option<String>,
    /// Times this batch was reclaimed from a lost worker
    pub retry_count: i64,
}

/// A registered render machine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRecord {
    /// Operator-supplied or hostname-derived identifier
    pub id: String,
    /// Reported IP address
    pub ip_address: String,
    /// Reported hostname
    pub hostname: String,
    /// Derived or stored status
    pub status: WorkerStatus,
    /// Capabilities blob reported at registration
    pub capabilities: Json<serde_json::Value>,
    /// Last heartbeat written to the store
    pub last_heartbeat: DateTime<Utc>,
    /// First registration time
    pub registered_at: DateTime<Utc>,
}

/// Everything needed to insert a job and its batches in one transaction.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Job id (UUID v4 string)
    pub id: String,
    /// Title
    pub title: String,
    /// Renderer kind name
    pub renderer: String,
    /// Priority
    pub priority: Priority,
    /// Full submission payload
    pub job_data: serde_json::Value,
    /// Batch frame ranges in output order; indices are assigned 1..N
    pub batches: Vec<String>,
}

/// The descriptor handed to a worker when it claims a batch. Also the wire
/// shape of the `/jobs/next` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedBatch {
    /// Batch id
    pub sub_job_id: String,
    /// Parent job id
    pub parent_job_id: String,
    /// Frame run to render
    pub frame_range: String,
    /// Parent job submission payload, verbatim
    pub job_data: serde_json::Value,
}

/// Sub-job id for a job and 1-based batch index.
pub fn sub_job_id(job_id: &str, batch_number: usize) -> String {
    format!("{job_id}_batch_{batch_number:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("CRITICAL".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!("normal".parse::<Priority>().unwrap(), Priority::Normal);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(SubJobStatus::Failed.is_terminal());
        assert!(!SubJobStatus::Paused.is_terminal());
    }

    #[test]
    fn test_sub_job_id_format() {
        assert_eq!(sub_job_id("abc", 1), "abc_batch_001");
        assert_eq!(sub_job_id("abc", 42), "abc_batch_042");
        let mut ids: Vec<String> = (1..=12).map(|i| sub_job_id("j", i)).collect();
        let sorted = ids.clone();
        ids.sort();
        assert_eq!(ids, sorted);
    }
}
