use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

use crate::error::QueueError;
use crate::jobs::error_codes::suggested_action;
use crate::jobs::guard::Enqueuer;
use crate::jobs::maintenance::cutoff_days;
use crate::jobs::model::{JobCategory, JobRecord, JobStatus};
use crate::jobs::store::{JobFilter, JobStore, NewJob, DEFAULT_PRIORITY};
use crate::jobs::worker::QueueWorker;

pub mod models;

use models::{
    ActionResponse, BulkRetryResponse, CategoryQuery, CategoryStats, CleanupRequest,
    CleanupResponse, EnqueueRequest, EnqueueResponse, ErrorBody, ExplainResponse, ListJobsQuery,
    ListJobsResponse, StatsResponse,
};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;
const DEFAULT_CLEANUP_DAYS: i64 = 1;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn JobStore>,
    pub enqueuer: Enqueuer,
    pub workers: Vec<QueueWorker>,
    pub api_token: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    let queue = Router::new()
        .route("/stats", get(queue_stats))
        .route("/worker", get(worker_status))
        .route("/jobs", get(list_jobs).post(enqueue_job))
        .route("/jobs/:id", get(get_job).delete(delete_job))
        .route("/jobs/:id/explain", get(explain_job))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/retry-all-failed", post(retry_all_failed))
        .route("/cleanup", post(cleanup))
        .route("/metrics/prom", get(metrics_prom))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .nest("/queue", queue)
        .route("/health", get(health))
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn err(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody { error: msg.into() }))
}

fn queue_err(e: QueueError) -> ApiError {
    let status = match &e {
        QueueError::JobNotFound(_) | QueueError::EntityNotFound(_) => StatusCode::NOT_FOUND,
        QueueError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        QueueError::VersionConflict { .. } => StatusCode::CONFLICT,
        QueueError::Payload(_) => StatusCode::BAD_REQUEST,
        QueueError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        QueueError::Storage(_) | QueueError::Update(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let msg = if status == StatusCode::INTERNAL_SERVER_ERROR {
        format!("internal error: {e}")
    } else {
        e.to_string()
    };
    err(status, msg)
}

fn parse_category(raw: Option<&str>) -> Result<Option<JobCategory>, ApiError> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<JobCategory>())
        .transpose()
        .map_err(|e| err(StatusCode::BAD_REQUEST, e))
}

fn parse_status(raw: Option<&str>) -> Result<Option<JobStatus>, ApiError> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(|e| err(StatusCode::BAD_REQUEST, e))
}

async fn load_job(state: &ApiState, id: &str) -> Result<JobRecord, ApiError> {
    state
        .store
        .get_job(id)
        .await
        .map_err(queue_err)?
        .ok_or_else(|| queue_err(QueueError::JobNotFound(id.to_string())))
}

/// Operator boundary. Disabled when no token is configured.
async fn require_token(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    if presented == Some(expected) {
        next.run(req).await
    } else {
        err(StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response()
    }
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn queue_stats(
    State(state): State<ApiState>,
    Query(q): Query<CategoryQuery>,
) -> ApiResult<StatsResponse> {
    let now = Utc::now();
    let only = parse_category(q.category.as_deref())?;

    let queue = state.store.stats(only, now).await.map_err(queue_err)?;

    let mut by_category = Vec::new();
    for category in JobCategory::ALL {
        if only.map_or(true, |c| c == category) {
            let stats = state
                .store
                .stats(Some(category), now)
                .await
                .map_err(queue_err)?;
            by_category.push(CategoryStats { category, stats });
        }
    }

    Ok(Json(StatsResponse {
        now_utc: now,
        queue,
        by_category,
        workers: state.workers.iter().map(|w| w.snapshot()).collect(),
    }))
}

pub async fn worker_status(
    State(state): State<ApiState>,
) -> Json<Vec<crate::jobs::worker::WorkerSnapshot>> {
    Json(state.workers.iter().map(|w| w.snapshot()).collect())
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> ApiResult<ListJobsResponse> {
    let filter = JobFilter {
        status: parse_status(q.status.as_deref())?,
        subject_id: q.subject_id.filter(|s| !s.trim().is_empty()),
        category: parse_category(q.category.as_deref())?,
    };
    let limit = q.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let skip = q.skip.unwrap_or(0).max(0);

    let items = state
        .store
        .list_jobs(&filter, limit, skip)
        .await
        .map_err(queue_err)?;
    let total = state.store.count_jobs(&filter).await.map_err(queue_err)?;

    Ok(Json(ListJobsResponse {
        items,
        total,
        limit,
        skip,
    }))
}

pub async fn enqueue_job(
    State(state): State<ApiState>,
    Json(body): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    if body.subject_id.trim().is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "subject_id is required"));
    }
    let max_attempts = body
        .max_attempts
        .unwrap_or_else(|| state.enqueuer.max_attempts_for(body.payload.category()));
    if max_attempts < 0 {
        return Err(err(StatusCode::BAD_REQUEST, "max_attempts must be >= 0"));
    }

    let mut job = NewJob::new(body.subject_id, body.payload)
        .priority(body.priority.unwrap_or(DEFAULT_PRIORITY))
        .max_attempts(max_attempts);
    if let Some(key) = body.key.filter(|k| !k.trim().is_empty()) {
        job = job.key(key);
    }

    let outcome = state.enqueuer.enqueue(job).await.map_err(queue_err)?;
    let status = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(EnqueueResponse {
            job_id: outcome.job_id,
            deduplicated: outcome.deduplicated,
            status: outcome.status,
        }),
    ))
}

pub async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<JobRecord> {
    load_job(&state, &id).await.map(Json)
}

pub async fn delete_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete_job(&id).await.map_err(queue_err)? {
        info!(job_id = %id, "job deleted by operator");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(queue_err(QueueError::JobNotFound(id)))
    }
}

pub async fn retry_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<ActionResponse> {
    if state.store.retry_failed(&id).await.map_err(queue_err)? {
        info!(job_id = %id, "failed job reset by operator");
        return Ok(Json(ActionResponse {
            success: true,
            job_id: id,
            status: JobStatus::Pending,
        }));
    }

    let job = load_job(&state, &id).await?;
    Err(err(
        StatusCode::CONFLICT,
        format!("job {id} is {} (only failed jobs can be retried)", job.status),
    ))
}

pub async fn cancel_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<ActionResponse> {
    if state
        .store
        .cancel(&id, Utc::now())
        .await
        .map_err(queue_err)?
    {
        info!(job_id = %id, "job cancelled by operator");
        return Ok(Json(ActionResponse {
            success: true,
            job_id: id,
            status: JobStatus::Failed,
        }));
    }

    let job = load_job(&state, &id).await?;
    Err(err(
        StatusCode::CONFLICT,
        format!(
            "job {id} is {} (only pending or retrying jobs can be cancelled)",
            job.status
        ),
    ))
}

pub async fn retry_all_failed(
    State(state): State<ApiState>,
    Query(q): Query<CategoryQuery>,
) -> ApiResult<BulkRetryResponse> {
    let category = parse_category(q.category.as_deref())?;
    let reset = state
        .store
        .retry_all_failed(category)
        .await
        .map_err(queue_err)?;
    info!(reset, category = ?category, "failed jobs reset by operator");
    Ok(Json(BulkRetryResponse { reset }))
}

pub async fn cleanup(
    State(state): State<ApiState>,
    body: Option<Json<CleanupRequest>>,
) -> ApiResult<CleanupResponse> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let days = body.older_than_days.unwrap_or(DEFAULT_CLEANUP_DAYS);
    if days < 0 {
        return Err(err(StatusCode::BAD_REQUEST, "olderThanDays must be >= 0"));
    }
    let category = parse_category(body.category.as_deref())?;

    let cutoff = cutoff_days(days);
    let deleted = state
        .store
        .delete_completed_before(cutoff, category)
        .await
        .map_err(queue_err)?;
    info!(deleted, older_than_days = days, "completed jobs cleaned up by operator");

    Ok(Json(CleanupResponse { deleted, cutoff }))
}

pub async fn explain_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<ExplainResponse> {
    let job = load_job(&state, &id).await?;

    let summary = match job.status {
        JobStatus::Completed => format!("Completed after {} attempt(s).", job.attempt.max(1)),
        JobStatus::Processing => format!(
            "Running attempt {} on {}.",
            job.attempt + 1,
            job.claimed_by.as_deref().unwrap_or("an unknown worker")
        ),
        JobStatus::Failed => format!(
            "Failed after {} attempt(s). Reason: {}.",
            job.attempt,
            job.failure_reason.map_or("UNKNOWN", |r| r.as_str())
        ),
        JobStatus::Retrying => {
            let next = job
                .next_attempt_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "now".to_string());
            format!("Retry {} of {} scheduled for {}.", job.attempt, job.max_attempts, next)
        }
        JobStatus::Pending => "Pending and waiting to be claimed.".to_string(),
    };

    let suggested_action = job
        .last_error
        .as_ref()
        .map(|e| suggested_action(&e.code).to_string());

    Ok(Json(ExplainResponse {
        job_id: job.id.clone(),
        category: job.category(),
        subject_id: job.subject_id.clone(),
        status: job.status,
        summary,
        attempt: job.attempt,
        max_attempts: job.max_attempts,
        next_attempt_at: job.next_attempt_at,
        last_error: job.last_error,
        failure_reason: job.failure_reason,
        suggested_action,
    }))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    let now = Utc::now();
    let mut body = String::new();

    body.push_str("# HELP casequeue_jobs Number of jobs by category and status\n");
    body.push_str("# TYPE casequeue_jobs gauge\n");
    let mut oldest = Vec::new();
    for category in JobCategory::ALL {
        let stats = match state.store.stats(Some(category), now).await {
            Ok(s) => s,
            Err(e) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("metrics error: {e}"),
                )
                    .into_response()
            }
        };
        for (status, n) in [
            (JobStatus::Pending, stats.pending),
            (JobStatus::Processing, stats.processing),
            (JobStatus::Retrying, stats.retrying),
            (JobStatus::Completed, stats.completed),
            (JobStatus::Failed, stats.failed),
        ] {
            let _ = writeln!(
                body,
                "casequeue_jobs{{category=\"{category}\",status=\"{status}\"}} {n}"
            );
        }
        oldest.push((category, stats.oldest_pending_age_ms.unwrap_or(0)));
    }

    body.push_str("# HELP casequeue_oldest_pending_age_seconds Age of the oldest pending job\n");
    body.push_str("# TYPE casequeue_oldest_pending_age_seconds gauge\n");
    for (category, ms) in oldest {
        let _ = writeln!(
            body,
            "casequeue_oldest_pending_age_seconds{{category=\"{category}\"}} {:.3}",
            ms as f64 / 1000.0
        );
    }

    body.push_str("# HELP casequeue_worker_in_flight Jobs currently executing per worker\n");
    body.push_str("# TYPE casequeue_worker_in_flight gauge\n");
    for w in &state.workers {
        let s = w.snapshot();
        let _ = writeln!(
            body,
            "casequeue_worker_in_flight{{worker=\"{}\"}} {}",
            s.worker_id, s.in_flight
        );
    }

    body.push_str("# HELP casequeue_worker_jobs_total Job outcomes recorded per worker\n");
    body.push_str("# TYPE casequeue_worker_jobs_total counter\n");
    for w in &state.workers {
        let s = w.snapshot();
        for (outcome, n) in [
            ("completed", s.completed),
            ("retried", s.retried),
            ("failed", s.failed),
            ("claim_lost", s.claim_lost),
        ] {
            let _ = writeln!(
                body,
                "casequeue_worker_jobs_total{{worker=\"{}\",outcome=\"{outcome}\"}} {n}",
                s.worker_id
            );
        }
    }

    (StatusCode::OK, body).into_response()
}
