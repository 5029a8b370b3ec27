// crates/casequeue/src/api/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::model::{FailureReason, JobCategory, JobPayload, JobRecord, JobStatus, LastError};
use crate::jobs::store::QueueStats;
use crate::jobs::worker::WorkerSnapshot;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CategoryQuery {
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CategoryStats {
    pub category: JobCategory,
    #[serde(flatten)]
    pub stats: QueueStats,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub now_utc: DateTime<Utc>,
    pub queue: QueueStats,
    pub by_category: Vec<CategoryStats>,
    pub workers: Vec<WorkerSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    #[serde(rename = "subjectId", alias = "subject_id")]
    pub subject_id: Option<String>,
    pub category: Option<String>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub items: Vec<JobRecord>,
    pub total: i64,
    pub limit: i64,
    pub skip: i64,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    /// Idempotency key; a second enqueue with the same key is a no-op.
    pub key: Option<String>,
    pub subject_id: String,
    #[serde(flatten)]
    pub payload: JobPayload,
    pub priority: Option<i32>,
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: String,
    pub deduplicated: bool,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct BulkRetryResponse {
    pub reset: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    #[serde(rename = "olderThanDays", alias = "older_than_days")]
    pub older_than_days: Option<i64>,
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: u64,
    pub cutoff: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ExplainResponse {
    pub job_id: String,
    pub category: JobCategory,
    pub subject_id: String,
    pub status: JobStatus,
    pub summary: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
    pub failure_reason: Option<FailureReason>,
    pub suggested_action: Option<String>,
}
