use crate::error::{QueueError, Result};
use crate::jobs::model::{FailureReason, JobCategory, JobRecord, JobStatus, LastError};
use crate::jobs::store::{EnqueueOutcome, JobFilter, JobStore, NewJob, QueueStats, Reclaimed};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    job: JobRecord,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<String, Slot>,
    next_seq: u64,
}

/// In-process job store. Every operation runs under one lock, which makes
/// claim and reclaim atomic the same way a conditional update is in Postgres.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<Mutex<State>>,
    offline: Arc<AtomicBool>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going away; every call fails with
    /// `QueueError::Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn with_claimed<F>(&self, job_id: &str, claim_token: Uuid, f: F) -> Result<bool>
    where
        F: FnOnce(&mut JobRecord),
    {
        self.check_online()?;
        let mut st = self.state.lock();
        match st.jobs.get_mut(job_id) {
            Some(slot)
                if slot.job.status == JobStatus::Processing
                    && slot.job.claim_token == Some(claim_token) =>
            {
                f(&mut slot.job);
                slot.job.claimed_by = None;
                slot.job.claim_token = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn sorted_newest_first(mut jobs: Vec<&Slot>) -> Vec<&Slot> {
    jobs.sort_by(|a, b| {
        b.job
            .created_at
            .cmp(&a.job.created_at)
            .then(b.seq.cmp(&a.seq))
    });
    jobs
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome> {
        self.check_online()?;
        let job_id = job.job_id();
        let mut st = self.state.lock();

        if let Some(existing) = st.jobs.get(&job_id) {
            return Ok(EnqueueOutcome {
                job_id,
                deduplicated: true,
                status: existing.job.status,
            });
        }

        let now = Utc::now();
        let seq = st.next_seq;
        st.next_seq += 1;
        st.jobs.insert(
            job_id.clone(),
            Slot {
                seq,
                job: JobRecord {
                    id: job_id.clone(),
                    subject_id: job.subject_id,
                    payload: job.payload,
                    status: JobStatus::Pending,
                    priority: job.priority,
                    attempt: 0,
                    max_attempts: job.max_attempts,
                    next_attempt_at: None,
                    last_error: None,
                    failure_reason: None,
                    claimed_by: None,
                    claim_token: None,
                    created_at: now,
                    claimed_at: None,
                    completed_at: None,
                    updated_at: now,
                },
            },
        );

        Ok(EnqueueOutcome {
            job_id,
            deduplicated: false,
            status: JobStatus::Pending,
        })
    }

    async fn claim_next(
        &self,
        categories: &[JobCategory],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        self.check_online()?;
        let mut st = self.state.lock();

        let candidate = st
            .jobs
            .values()
            .filter(|s| categories.contains(&s.job.category()) && s.job.is_claimable(now))
            .min_by(|a, b| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then(a.job.created_at.cmp(&b.job.created_at))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|s| s.job.id.clone());

        let Some(id) = candidate else {
            return Ok(None);
        };

        let slot = st
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;
        slot.job.status = JobStatus::Processing;
        slot.job.claimed_at = Some(now);
        slot.job.claimed_by = Some(worker_id.to_string());
        slot.job.claim_token = Some(Uuid::new_v4());
        slot.job.updated_at = now;
        Ok(Some(slot.job.clone()))
    }

    async fn mark_completed(
        &self,
        job_id: &str,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_claimed(job_id, claim_token, |job| {
            job.status = JobStatus::Completed;
            job.attempt += 1;
            job.completed_at = Some(now);
            job.next_attempt_at = None;
            job.updated_at = now;
        })
    }

    async fn schedule_retry(
        &self,
        job_id: &str,
        claim_token: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &LastError,
    ) -> Result<bool> {
        self.with_claimed(job_id, claim_token, |job| {
            job.status = JobStatus::Retrying;
            job.attempt += 1;
            job.next_attempt_at = Some(next_attempt_at);
            job.last_error = Some(error.clone());
            job.updated_at = error.at;
        })
    }

    async fn mark_failed(
        &self,
        job_id: &str,
        claim_token: Uuid,
        reason: FailureReason,
        error: &LastError,
    ) -> Result<bool> {
        self.with_claimed(job_id, claim_token, |job| {
            job.status = JobStatus::Failed;
            job.attempt += 1;
            job.next_attempt_at = None;
            job.last_error = Some(error.clone());
            job.failure_reason = Some(reason);
            job.completed_at = Some(error.at);
            job.updated_at = error.at;
        })
    }

    async fn reclaim_stuck(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Reclaimed> {
        self.check_online()?;
        let mut st = self.state.lock();
        let mut out = Reclaimed::default();

        for slot in st.jobs.values_mut() {
            let job = &mut slot.job;
            let stuck = job.status == JobStatus::Processing
                && job.claimed_at.map_or(false, |t| t < older_than);
            if !stuck {
                continue;
            }

            job.attempt += 1;
            job.last_error = Some(LastError::stuck(now));
            job.claimed_by = None;
            job.claim_token = None;
            job.updated_at = now;
            if job.attempt > job.max_attempts {
                job.status = JobStatus::Failed;
                job.failure_reason = Some(FailureReason::MaxAttemptsExceeded);
                job.next_attempt_at = None;
                job.completed_at = Some(now);
                out.failed.push(job.clone());
            } else {
                job.status = JobStatus::Retrying;
                job.next_attempt_at = Some(now);
                out.retrying += 1;
            }
        }

        Ok(out)
    }

    async fn stats(&self, category: Option<JobCategory>, now: DateTime<Utc>) -> Result<QueueStats> {
        self.check_online()?;
        let st = self.state.lock();
        let mut stats = QueueStats::default();
        let mut oldest: Option<DateTime<Utc>> = None;

        for slot in st.jobs.values() {
            if category.map_or(false, |c| slot.job.category() != c) {
                continue;
            }
            stats.add(slot.job.status, 1);
            if slot.job.status == JobStatus::Pending {
                oldest = Some(oldest.map_or(slot.job.created_at, |o| o.min(slot.job.created_at)));
            }
        }

        stats.set_oldest_pending(oldest, now);
        Ok(stats)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.check_online()?;
        Ok(self.state.lock().jobs.get(job_id).map(|s| s.job.clone()))
    }

    async fn list_jobs(&self, filter: &JobFilter, limit: i64, skip: i64) -> Result<Vec<JobRecord>> {
        self.check_online()?;
        let st = self.state.lock();
        let matching: Vec<&Slot> = st.jobs.values().filter(|s| filter.matches(&s.job)).collect();

        Ok(sorted_newest_first(matching)
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|s| s.job.clone())
            .collect())
    }

    async fn count_jobs(&self, filter: &JobFilter) -> Result<i64> {
        self.check_online()?;
        let st = self.state.lock();
        Ok(st.jobs.values().filter(|s| filter.matches(&s.job)).count() as i64)
    }

    async fn retry_failed(&self, job_id: &str) -> Result<bool> {
        self.check_online()?;
        let mut st = self.state.lock();
        match st.jobs.get_mut(job_id) {
            Some(slot) if slot.job.status == JobStatus::Failed => {
                reset_for_retry(&mut slot.job, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn retry_all_failed(&self, category: Option<JobCategory>) -> Result<u64> {
        self.check_online()?;
        let now = Utc::now();
        let mut st = self.state.lock();
        let mut n = 0;
        for slot in st.jobs.values_mut() {
            if slot.job.status == JobStatus::Failed
                && category.map_or(true, |c| slot.job.category() == c)
            {
                reset_for_retry(&mut slot.job, now);
                n += 1;
            }
        }
        Ok(n)
    }

    async fn cancel(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        self.check_online()?;
        let mut st = self.state.lock();
        match st.jobs.get_mut(job_id) {
            Some(slot)
                if matches!(slot.job.status, JobStatus::Pending | JobStatus::Retrying) =>
            {
                let job = &mut slot.job;
                job.status = JobStatus::Failed;
                job.failure_reason = Some(FailureReason::Cancelled);
                job.last_error = Some(LastError::cancelled(now));
                job.next_attempt_at = None;
                job.completed_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_completed_before(
        &self,
        cutoff: DateTime<Utc>,
        category: Option<JobCategory>,
    ) -> Result<u64> {
        self.check_online()?;
        let mut st = self.state.lock();
        let before = st.jobs.len();
        st.jobs.retain(|_, s| {
            let expired = s.job.status == JobStatus::Completed
                && s.job.completed_at.map_or(false, |t| t < cutoff)
                && category.map_or(true, |c| s.job.category() == c);
            !expired
        });
        Ok((before - st.jobs.len()) as u64)
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.state.lock().jobs.remove(job_id).is_some())
    }
}

fn reset_for_retry(job: &mut JobRecord, now: DateTime<Utc>) {
    job.status = JobStatus::Pending;
    job.attempt = 0;
    job.last_error = None;
    job.failure_reason = None;
    job.next_attempt_at = None;
    job.completed_at = None;
    job.claimed_at = None;
    job.claimed_by = None;
    job.claim_token = None;
    job.updated_at = now;
}
