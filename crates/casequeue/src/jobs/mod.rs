pub mod error_codes;
pub mod guard;
pub mod maintenance;
pub mod memory;
pub mod model;
pub mod registry;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod store;
pub mod worker;

pub use guard::Enqueuer;
pub use maintenance::{cutoff_days, RetentionSweeper};
pub use memory::MemoryJobStore;
pub use model::{
    DocumentJob, ErrorClass, FailureReason, FileData, JobCategory, JobPayload, JobRecord,
    JobStatus, LastError, WebhookJob, WebhookType,
};
pub use registry::{HandlerOptions, HandlerRegistry, JobContext, JobError};
pub use repo::PgJobStore;
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{JobRunner, Outcome};
pub use store::{EnqueueOutcome, JobFilter, JobStore, NewJob, QueueStats};
pub use worker::{QueueWorker, WorkerConfig, WorkerSnapshot, WorkerState};
