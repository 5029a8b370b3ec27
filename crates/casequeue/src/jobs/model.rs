use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job families sharing one store. Each family has its own payload schema,
/// retention window and id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobCategory {
    DocumentProcessing,
    WebhookDelivery,
}

impl JobCategory {
    pub const ALL: [JobCategory; 2] = [JobCategory::DocumentProcessing, JobCategory::WebhookDelivery];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::DocumentProcessing => "document-processing",
            JobCategory::WebhookDelivery => "webhook-delivery",
        }
    }

    pub fn id_prefix(&self) -> &'static str {
        match self {
            JobCategory::DocumentProcessing => "docjob",
            JobCategory::WebhookDelivery => "whjob",
        }
    }

    /// How long a completed job is kept before the retention sweep deletes it.
    pub fn retention(&self) -> Duration {
        match self {
            JobCategory::DocumentProcessing => Duration::hours(24),
            JobCategory::WebhookDelivery => Duration::days(7),
        }
    }
}

impl fmt::Display for JobCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "document-processing" => Ok(JobCategory::DocumentProcessing),
            "webhook-delivery" => Ok(JobCategory::WebhookDelivery),
            other => Err(format!("unknown job category: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// How an error is treated by the retry policy and shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Retryable,
    Permanent,
    Cancelled,
    Stuck,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Stuck => "stuck",
        }
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retryable" => Ok(ErrorClass::Retryable),
            "permanent" => Ok(ErrorClass::Permanent),
            "cancelled" => Ok(ErrorClass::Cancelled),
            "stuck" => Ok(ErrorClass::Stuck),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

/// Why a job ended up in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    NonRetryable,
    MaxAttemptsExceeded,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NonRetryable => "NON_RETRYABLE",
            FailureReason::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            FailureReason::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NON_RETRYABLE" => Ok(FailureReason::NonRetryable),
            "MAX_ATTEMPTS_EXCEEDED" => Ok(FailureReason::MaxAttemptsExceeded),
            "CANCELLED" => Ok(FailureReason::Cancelled),
            other => Err(format!("unknown failure reason: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub code: String,
    pub message: String,
    pub classification: ErrorClass,
    pub at: DateTime<Utc>,
}

impl LastError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        classification: ErrorClass,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            classification,
            at,
        }
    }

    pub fn cancelled(at: DateTime<Utc>) -> Self {
        Self::new("CANCELLED", "Job cancelled by operator", ErrorClass::Cancelled, at)
    }

    pub fn stuck(at: DateTime<Utc>) -> Self {
        Self::new(
            "STUCK",
            "Job timed out (stuck in processing)",
            ErrorClass::Stuck,
            at,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    pub filename: String,
    #[serde(default)]
    pub gcs_path: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    #[serde(default)]
    pub size: u64,
}

fn default_mime_type() -> String {
    "image/png".to_string()
}

/// An uploaded client document that must go through extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentJob {
    pub document_id: String,
    pub file: FileData,
    #[serde(default)]
    pub client_name: Option<String>,
    pub webhook_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookType {
    AiProcessing,
    Deduplication,
    PortalWebhook,
}

/// An inbound webhook whose processing was deferred to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookJob {
    pub webhook_type: WebhookType,
    pub body: Value,
}

/// Typed payload; the variant decides the job category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "payload", rename_all = "kebab-case")]
pub enum JobPayload {
    DocumentProcessing(DocumentJob),
    WebhookDelivery(WebhookJob),
}

impl JobPayload {
    pub fn category(&self) -> JobCategory {
        match self {
            JobPayload::DocumentProcessing(_) => JobCategory::DocumentProcessing,
            JobPayload::WebhookDelivery(_) => JobCategory::WebhookDelivery,
        }
    }

    /// Payload body without the category tag, as persisted.
    pub fn to_json(&self) -> serde_json::Result<Value> {
        match self {
            JobPayload::DocumentProcessing(p) => serde_json::to_value(p),
            JobPayload::WebhookDelivery(p) => serde_json::to_value(p),
        }
    }

    pub fn from_parts(category: JobCategory, body: Value) -> serde_json::Result<Self> {
        Ok(match category {
            JobCategory::DocumentProcessing => {
                JobPayload::DocumentProcessing(serde_json::from_value(body)?)
            }
            JobCategory::WebhookDelivery => JobPayload::WebhookDelivery(serde_json::from_value(body)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub subject_id: String,
    #[serde(flatten)]
    pub payload: JobPayload,
    pub status: JobStatus,
    pub priority: i32,
    pub attempt: i32,
    pub max_attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
    pub failure_reason: Option<FailureReason>,
    pub claimed_by: Option<String>,
    /// Identifies the current claim; cleared by every transition out of
    /// `processing`.
    #[serde(skip)]
    pub claim_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn category(&self) -> JobCategory {
        self.payload.category()
    }

    /// Whether `claim_next` may hand this job out at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Retrying => self.next_attempt_at.map_or(true, |t| t <= now),
            _ => false,
        }
    }
}
