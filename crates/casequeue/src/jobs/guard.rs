use crate::error::{QueueError, Result};
use crate::jobs::model::JobCategory;
use crate::jobs::store::{EnqueueOutcome, JobStore, NewJob, DEFAULT_MAX_ATTEMPTS};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Enqueue entry point for producers: rejects oversized payloads before they
/// reach the store and logs the outcome.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn JobStore>,
    max_payload_bytes: usize,
    max_attempts: HashMap<JobCategory, i32>,
}

impl Enqueuer {
    pub fn new(store: Arc<dyn JobStore>, max_payload_bytes: usize) -> Self {
        Self {
            store,
            max_payload_bytes,
            max_attempts: HashMap::new(),
        }
    }

    /// Retry budget given to jobs of `category` when the producer does not
    /// set one.
    pub fn with_max_attempts(mut self, category: JobCategory, max_attempts: i32) -> Self {
        self.max_attempts.insert(category, max_attempts);
        self
    }

    pub fn max_attempts_for(&self, category: JobCategory) -> i32 {
        self.max_attempts
            .get(&category)
            .copied()
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn check_payload(&self, job: &NewJob) -> Result<()> {
        let size = serde_json::to_vec(&job.payload.to_json()?)?.len();
        if size > self.max_payload_bytes {
            warn!(
                category = %job.category(),
                subject_id = %job.subject_id,
                size,
                max = self.max_payload_bytes,
                "enqueue denied, payload too large"
            );
            return Err(QueueError::PayloadTooLarge {
                size,
                max: self.max_payload_bytes,
            });
        }
        Ok(())
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome> {
        self.check_payload(&job)?;
        let category = job.category();
        let subject_id = job.subject_id.clone();
        let priority = job.priority;

        let outcome = self.store.enqueue(job).await?;
        if outcome.deduplicated {
            info!(
                job_id = %outcome.job_id,
                category = %category,
                status = %outcome.status,
                "enqueue deduplicated"
            );
        } else {
            info!(
                job_id = %outcome.job_id,
                category = %category,
                subject_id = %subject_id,
                priority,
                "job enqueued"
            );
        }
        Ok(outcome)
    }
}
