use crate::error::Result;
use crate::jobs::model::{FailureReason, JobCategory, JobPayload, JobRecord, JobStatus, LastError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone)]
pub struct NewJob {
    /// Idempotency key; becomes the job id. Generated when absent.
    pub key: Option<String>,
    pub subject_id: String,
    pub payload: JobPayload,
    pub priority: i32,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(subject_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            key: None,
            subject_id: subject_id.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn category(&self) -> JobCategory {
        self.payload.category()
    }

    /// The id this job will be stored under.
    pub fn job_id(&self) -> String {
        match &self.key {
            Some(k) => k.clone(),
            None => format!("{}_{}", self.category().id_prefix(), Uuid::new_v4()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnqueueOutcome {
    pub job_id: String,
    /// True when a record already existed under the key and nothing was inserted.
    pub deduplicated: bool,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub subject_id: Option<String>,
    pub category: Option<JobCategory>,
}

impl JobFilter {
    pub fn matches(&self, job: &JobRecord) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self
                .subject_id
                .as_deref()
                .map_or(true, |s| job.subject_id == s)
            && self.category.map_or(true, |c| job.category() == c)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub retrying: i64,
    pub total: i64,
    pub in_flight: i64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub oldest_pending_age_ms: Option<i64>,
}

impl QueueStats {
    pub fn add(&mut self, status: JobStatus, n: i64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Retrying => self.retrying += n,
        }
        self.total += n;
        if status == JobStatus::Processing {
            self.in_flight += n;
        }
    }

    pub fn set_oldest_pending(&mut self, created_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        self.oldest_pending_at = created_at;
        self.oldest_pending_age_ms = created_at.map(|t| (now - t).num_milliseconds().max(0));
    }
}

/// What one `reclaim_stuck` pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reclaimed {
    /// Jobs handed back as `retrying`.
    pub retrying: u64,
    /// Jobs that ran out of attempts and are now `failed`.
    pub failed: Vec<JobRecord>,
}

impl Reclaimed {
    pub fn total(&self) -> u64 {
        self.retrying + self.failed.len() as u64
    }
}

/// Durable job collection. Every state transition is a single conditional
/// update so that concurrent workers and operators cannot interleave.
///
/// Every claim gets a fresh `claim_token`. Transitions taken by workers
/// (`mark_completed`, `schedule_retry`, `mark_failed`) only apply while the
/// job is `processing` under that token; they return `false` when the claim
/// was lost, even if the same worker has since claimed the job again.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome>;

    /// Claim the oldest eligible job by (priority asc, created_at asc).
    async fn claim_next(
        &self,
        categories: &[JobCategory],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>>;

    async fn mark_completed(&self, job_id: &str, claim_token: Uuid, now: DateTime<Utc>)
        -> Result<bool>;

    async fn schedule_retry(
        &self,
        job_id: &str,
        claim_token: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &LastError,
    ) -> Result<bool>;

    async fn mark_failed(
        &self,
        job_id: &str,
        claim_token: Uuid,
        reason: FailureReason,
        error: &LastError,
    ) -> Result<bool>;

    /// Move `processing` jobs claimed before `older_than` back to `retrying`
    /// (or to `failed` once their attempts are used up).
    async fn reclaim_stuck(&self, older_than: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<Reclaimed>;

    async fn stats(&self, category: Option<JobCategory>, now: DateTime<Utc>) -> Result<QueueStats>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Newest first.
    async fn list_jobs(&self, filter: &JobFilter, limit: i64, skip: i64) -> Result<Vec<JobRecord>>;

    async fn count_jobs(&self, filter: &JobFilter) -> Result<i64>;

    /// `failed` → `pending` with attempt and error cleared.
    async fn retry_failed(&self, job_id: &str) -> Result<bool>;

    async fn retry_all_failed(&self, category: Option<JobCategory>) -> Result<u64>;

    /// `pending`/`retrying` → `failed` with a cancellation error.
    async fn cancel(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn delete_completed_before(
        &self,
        cutoff: DateTime<Utc>,
        category: Option<JobCategory>,
    ) -> Result<u64>;

    async fn delete_job(&self, job_id: &str) -> Result<bool>;
}
