use crate::error::Result;
use crate::jobs::{
    model::{ErrorClass, FailureReason, JobCategory, JobRecord, LastError},
    registry::JobError,
    retry::{RetryDecision, RetryPolicy},
    store::JobStore,
};
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Where a finished attempt left the job.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    RetryScheduled { next_attempt_at: DateTime<Utc> },
    Failed { reason: FailureReason },
    /// The claim was reaped or the job was reset while the handler ran; the
    /// result was discarded.
    ClaimLost,
}

/// Turns handler results into store transitions.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    default_policy: RetryPolicy,
    policies: HashMap<JobCategory, RetryPolicy>,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, default_policy: RetryPolicy) -> Self {
        Self {
            store,
            default_policy,
            policies: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, category: JobCategory, policy: RetryPolicy) -> Self {
        self.policies.insert(category, policy);
        self
    }

    pub fn policy_for(&self, category: JobCategory) -> &RetryPolicy {
        self.policies.get(&category).unwrap_or(&self.default_policy)
    }

    pub async fn on_success(&self, job: &JobRecord, worker_id: &str) -> Result<Outcome> {
        let Some(token) = job.claim_token else {
            warn!(job_id = %job.id, worker_id, "completion for a job without a claim token");
            return Ok(Outcome::ClaimLost);
        };
        let applied = self.store.mark_completed(&job.id, token, Utc::now()).await?;

        if !applied {
            warn!(job_id = %job.id, worker_id, category = %job.category(), "completion discarded, claim lost");
            return Ok(Outcome::ClaimLost);
        }

        info!(
            job_id = %job.id,
            category = %job.category(),
            attempt = job.attempt + 1,
            "job completed"
        );
        Ok(Outcome::Completed)
    }

    pub async fn on_failure(
        &self,
        job: &JobRecord,
        worker_id: &str,
        err: &JobError,
    ) -> Result<Outcome> {
        let Some(token) = job.claim_token else {
            warn!(job_id = %job.id, worker_id, code = %err.code, "failure for a job without a claim token");
            return Ok(Outcome::ClaimLost);
        };
        let now = Utc::now();
        // 1-based number of the attempt that just failed
        let attempt_no = job.attempt + 1;
        let class = err.classify();
        let last_error = LastError::new(err.code.clone(), err.message.clone(), class, now);

        // decide retry vs terminal failure
        let mut rng = StdRng::from_entropy();
        let decision =
            self.policy_for(job.category())
                .decide(attempt_no, job.max_attempts, class, &mut rng);

        let (applied, outcome) = match decision {
            RetryDecision::Retry { delay } => {
                let next_attempt_at = now + delay;
                let applied = self
                    .store
                    .schedule_retry(&job.id, token, next_attempt_at, &last_error)
                    .await?;
                (applied, Outcome::RetryScheduled { next_attempt_at })
            }
            RetryDecision::GiveUp => {
                let reason = match class {
                    ErrorClass::Retryable => FailureReason::MaxAttemptsExceeded,
                    _ => FailureReason::NonRetryable,
                };
                let applied = self
                    .store
                    .mark_failed(&job.id, token, reason, &last_error)
                    .await?;
                (applied, Outcome::Failed { reason })
            }
        };

        if !applied {
            warn!(job_id = %job.id, worker_id, category = %job.category(), code = %err.code, "failure discarded, claim lost");
            return Ok(Outcome::ClaimLost);
        }

        match &outcome {
            Outcome::RetryScheduled { next_attempt_at } => info!(
                job_id = %job.id,
                category = %job.category(),
                attempt = attempt_no,
                code = %err.code,
                next_attempt_at = %next_attempt_at,
                "job failed, retry scheduled"
            ),
            Outcome::Failed { reason } => warn!(
                job_id = %job.id,
                category = %job.category(),
                attempt = attempt_no,
                code = %err.code,
                reason = reason.as_str(),
                error = %err.message,
                "job failed permanently"
            ),
            _ => {}
        }

        Ok(outcome)
    }
}
