use crate::jobs::{
    model::{JobCategory, JobRecord},
    registry::{HandlerRegistry, JobContext, JobError},
    runner::{JobRunner, Outcome},
    store::JobStore,
};
use crate::jobs::error_codes::ErrorCode;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub categories: Vec<JobCategory>,
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    /// A `processing` job claimed longer ago than this is considered stuck.
    pub job_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, categories: Vec<JobCategory>) -> Self {
        Self {
            worker_id: worker_id.into(),
            categories,
            max_concurrent: 2,
            poll_interval: Duration::from_millis(2000),
            job_timeout: Duration::from_secs(10 * 60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Running,
    Draining,
}

#[derive(Default)]
struct Counters {
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    claim_lost: AtomicU64,
    reclaimed: AtomicU64,
    poll_errors: AtomicU64,
    outcome_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub state: WorkerState,
    pub categories: Vec<JobCategory>,
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
    pub job_timeout_ms: u64,
    pub in_flight: usize,
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub claim_lost: u64,
    pub reclaimed: u64,
    pub poll_errors: u64,
    pub outcome_errors: u64,
    pub started_at: Option<DateTime<Utc>>,
}

struct RunHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    cfg: WorkerConfig,
    store: Arc<dyn JobStore>,
    runner: JobRunner,
    registry: Arc<HandlerRegistry>,
    ctx: JobContext,
    state: Mutex<WorkerState>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    in_flight: AtomicUsize,
    counters: Counters,
    run: Mutex<Option<RunHandle>>,
}

/// Polls the store for its categories, runs up to `max_concurrent` jobs at
/// once and records each outcome.
///
/// `stopped → running → draining → stopped`. Stopping waits up to
/// `shutdown_grace` for in-flight jobs, then aborts them; aborted jobs stay
/// `processing` until the reaper of some worker reclaims them.
#[derive(Clone)]
pub struct QueueWorker {
    inner: Arc<Inner>,
}

struct InFlight(Arc<Inner>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl QueueWorker {
    pub fn new(
        cfg: WorkerConfig,
        store: Arc<dyn JobStore>,
        runner: JobRunner,
        registry: Arc<HandlerRegistry>,
        ctx: JobContext,
    ) -> Self {
        let ctx = JobContext {
            worker_id: cfg.worker_id.clone(),
            ..ctx
        };
        Self {
            inner: Arc::new(Inner {
                cfg,
                store,
                runner,
                registry,
                ctx,
                state: Mutex::new(WorkerState::Stopped),
                started_at: Mutex::new(None),
                in_flight: AtomicUsize::new(0),
                counters: Counters::default(),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.cfg.worker_id
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.lock()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Returns false when the worker is not `stopped`.
    pub fn start(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state != WorkerState::Stopped {
                return false;
            }
            *state = WorkerState::Running;
        }
        *self.inner.started_at.lock() = Some(Utc::now());

        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(self.inner.clone(), rx));
        *self.inner.run.lock() = Some(RunHandle { shutdown, task });

        info!(
            worker_id = %self.inner.cfg.worker_id,
            categories = ?self.inner.cfg.categories,
            max_concurrent = self.inner.cfg.max_concurrent,
            poll_interval_ms = self.inner.cfg.poll_interval.as_millis() as u64,
            "queue worker started"
        );
        true
    }

    /// Stop claiming, drain in-flight jobs and wait for the loop to exit.
    pub async fn stop(&self) {
        let run = self.inner.run.lock().take();
        let Some(run) = run else {
            return;
        };
        let _ = run.shutdown.send(true);
        if let Err(e) = run.task.await {
            error!(worker_id = %self.inner.cfg.worker_id, error = %e, "poll loop ended abnormally");
            *self.inner.state.lock() = WorkerState::Stopped;
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let i = &self.inner;
        let c = &i.counters;
        WorkerSnapshot {
            worker_id: i.cfg.worker_id.clone(),
            state: *i.state.lock(),
            categories: i.cfg.categories.clone(),
            max_concurrent: i.cfg.max_concurrent,
            poll_interval_ms: i.cfg.poll_interval.as_millis() as u64,
            job_timeout_ms: i.cfg.job_timeout.as_millis() as u64,
            in_flight: i.in_flight.load(Ordering::SeqCst),
            claimed: c.claimed.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            claim_lost: c.claim_lost.load(Ordering::Relaxed),
            reclaimed: c.reclaimed.load(Ordering::Relaxed),
            poll_errors: c.poll_errors.load(Ordering::Relaxed),
            outcome_errors: c.outcome_errors.load(Ordering::Relaxed),
            started_at: *i.started_at.lock(),
        }
    }
}

async fn poll_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let semaphore = Arc::new(Semaphore::new(inner.cfg.max_concurrent.max(1)));
    let mut tasks = JoinSet::new();

    loop {
        while let Some(res) = tasks.try_join_next() {
            if let Err(e) = res {
                error!(worker_id = %inner.cfg.worker_id, error = %e, "job task ended abnormally");
            }
        }

        poll_once(&inner, &semaphore, &mut tasks).await;

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(inner.cfg.poll_interval) => {}
        }
    }

    *inner.state.lock() = WorkerState::Draining;
    let pending = tasks.len();
    info!(worker_id = %inner.cfg.worker_id, in_flight = pending, "queue worker draining");

    let started = Instant::now();
    let drained = tokio::time::timeout(inner.cfg.shutdown_grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            worker_id = %inner.cfg.worker_id,
            remaining = tasks.len(),
            grace_ms = inner.cfg.shutdown_grace.as_millis() as u64,
            "grace period elapsed, aborting in-flight jobs"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    *inner.state.lock() = WorkerState::Stopped;
    info!(
        worker_id = %inner.cfg.worker_id,
        drained_in_ms = started.elapsed().as_millis() as u64,
        "queue worker stopped"
    );
}

/// One cycle: reclaim stuck jobs, then claim until the worker is full or the
/// queue is empty. Storage errors end the cycle; the next one tries again.
async fn poll_once(inner: &Arc<Inner>, semaphore: &Arc<Semaphore>, tasks: &mut JoinSet<()>) {
    let now = Utc::now();
    let timeout = chrono::Duration::milliseconds(inner.cfg.job_timeout.as_millis().min(i64::MAX as u128) as i64);

    match inner.store.reclaim_stuck(now - timeout, now).await {
        Ok(r) if r.total() == 0 => {}
        Ok(r) => {
            inner.counters.reclaimed.fetch_add(r.total(), Ordering::Relaxed);
            warn!(
                worker_id = %inner.cfg.worker_id,
                retrying = r.retrying,
                failed = r.failed.len(),
                "reclaimed stuck jobs"
            );
            for job in &r.failed {
                run_failed_hook(inner, job).await;
            }
        }
        Err(e) => {
            inner.counters.poll_errors.fetch_add(1, Ordering::Relaxed);
            error!(worker_id = %inner.cfg.worker_id, error = %e, "reclaim failed");
            return;
        }
    }

    loop {
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            debug!(worker_id = %inner.cfg.worker_id, "at capacity");
            return;
        };

        let claimed = inner
            .store
            .claim_next(&inner.cfg.categories, &inner.cfg.worker_id, Utc::now())
            .await;

        match claimed {
            Ok(Some(job)) => {
                inner.counters.claimed.fetch_add(1, Ordering::Relaxed);
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                debug!(
                    worker_id = %inner.cfg.worker_id,
                    job_id = %job.id,
                    category = %job.category(),
                    attempt = job.attempt + 1,
                    "job claimed"
                );
                let guard = InFlight(inner.clone());
                tasks.spawn(execute(inner.clone(), job, permit, guard));
            }
            Ok(None) => return,
            Err(e) => {
                inner.counters.poll_errors.fetch_add(1, Ordering::Relaxed);
                error!(worker_id = %inner.cfg.worker_id, error = %e, "claim failed");
                return;
            }
        }
    }
}

/// A stuck job the reaper moved to `failed` never reaches `execute` again, so
/// its category's failure hook runs here.
async fn run_failed_hook(inner: &Arc<Inner>, job: &JobRecord) {
    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
    let Some(entry) = inner.registry.handler_for(job.category()) else {
        return;
    };
    let err = match &job.last_error {
        Some(last) => JobError::new(last.code.clone(), last.message.clone()),
        None => JobError::coded(ErrorCode::Stuck, "stuck in processing"),
    };
    entry.failed(job, &err, &inner.ctx).await;
}

async fn execute(inner: Arc<Inner>, job: JobRecord, _permit: OwnedSemaphorePermit, _guard: InFlight) {
    let entry = inner.registry.handler_for(job.category());

    let result = match &entry {
        Some(entry) => entry.run(&job, &inner.ctx).await,
        None => Err(JobError::coded(
            ErrorCode::UnknownCategory,
            format!("no handler for category={}", job.category()),
        )),
    };

    let (outcome, err) = match result {
        Ok(()) => (inner.runner.on_success(&job, &inner.cfg.worker_id).await, None),
        Err(err) => (
            inner.runner.on_failure(&job, &inner.cfg.worker_id, &err).await,
            Some(err),
        ),
    };

    let counters = &inner.counters;
    match outcome {
        Ok(Outcome::Completed) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Outcome::RetryScheduled { .. }) => {
            counters.retried.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Outcome::Failed { .. }) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            if let (Some(entry), Some(err)) = (&entry, &err) {
                entry.failed(&job, err, &inner.ctx).await;
            }
        }
        Ok(Outcome::ClaimLost) => {
            counters.claim_lost.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            // The claim stays in place; the reaper returns the job after the timeout.
            counters.outcome_errors.fetch_add(1, Ordering::Relaxed);
            error!(
                worker_id = %inner.cfg.worker_id,
                job_id = %job.id,
                error = %e,
                "could not record job outcome"
            );
        }
    }
}
