// crates/casequeue/src/jobs/repo.rs

use crate::error::{QueueError, Result};
use crate::jobs::model::{
    ErrorClass, FailureReason, JobCategory, JobPayload, JobRecord, JobStatus, LastError,
};
use crate::jobs::store::{EnqueueOutcome, JobFilter, JobStore, NewJob, QueueStats, Reclaimed};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    category: String,
    subject_id: String,
    payload_json: Value,
    status: String,
    priority: i32,
    attempt: i32,
    max_attempts: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    last_error_class: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    claimed_by: Option<String>,
    claim_token: Option<Uuid>,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

fn decode_err(msg: String) -> QueueError {
    QueueError::Storage(sqlx::Error::Decode(msg.into()))
}

impl TryFrom<JobRow> for JobRecord {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        let category: JobCategory = row.category.parse().map_err(decode_err)?;
        let status: JobStatus = row.status.parse().map_err(decode_err)?;
        let payload = JobPayload::from_parts(category, row.payload_json)?;

        let last_error = match (
            row.last_error_code,
            row.last_error_message,
            row.last_error_class,
            row.last_error_at,
        ) {
            (Some(code), Some(message), Some(class), Some(at)) => Some(LastError {
                code,
                message,
                classification: class.parse::<ErrorClass>().map_err(decode_err)?,
                at,
            }),
            _ => None,
        };

        let failure_reason = row
            .failure_reason
            .map(|r| r.parse::<FailureReason>())
            .transpose()
            .map_err(decode_err)?;

        Ok(JobRecord {
            id: row.id,
            subject_id: row.subject_id,
            payload,
            status,
            priority: row.priority,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            next_attempt_at: row.next_attempt_at,
            last_error,
            failure_reason,
            claimed_by: row.claimed_by,
            claim_token: row.claim_token,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A claimed row whose payload no longer matches its category can never
    /// succeed; fail it here so the poll loop does not keep reclaiming it.
    async fn fail_undecodable(&self, job_id: &str, err: &QueueError, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                attempt = attempt + 1,
                failure_reason = 'NON_RETRYABLE',
                last_error_code = 'BAD_PAYLOAD',
                last_error_message = $2,
                last_error_class = 'permanent',
                last_error_at = $3,
                claimed_by = NULL,
                claim_token = NULL,
                next_attempt_at = NULL,
                completed_at = $3,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(err.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn category_filter(category: Option<JobCategory>) -> Option<&'static str> {
    category.map(|c| c.as_str())
}

#[async_trait]
impl JobStore for PgJobStore {
    // ----------------------------
    // Enqueue
    // ----------------------------

    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome> {
        let job_id = job.job_id();
        let category = job.category();
        let payload_json = job.payload.to_json()?;

        // The primary key turns concurrent producers racing on one key into a
        // single insert; losers fall through to reading the winner's status.
        for _ in 0..3 {
            let inserted: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO jobs (id, category, subject_id, payload_json, status, priority, max_attempts)
                VALUES ($1, $2, $3, $4, 'pending', $5, $6)
                ON CONFLICT (id) DO NOTHING
                RETURNING status
                "#,
            )
            .bind(&job_id)
            .bind(category.as_str())
            .bind(&job.subject_id)
            .bind(&payload_json)
            .bind(job.priority)
            .bind(job.max_attempts)
            .fetch_optional(&self.pool)
            .await?;

            if inserted.is_some() {
                return Ok(EnqueueOutcome {
                    job_id,
                    deduplicated: false,
                    status: JobStatus::Pending,
                });
            }

            let existing: Option<String> =
                sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
                    .bind(&job_id)
                    .fetch_optional(&self.pool)
                    .await?;

            if let Some(status) = existing {
                return Ok(EnqueueOutcome {
                    job_id,
                    deduplicated: true,
                    status: status.parse().map_err(decode_err)?,
                });
            }
            // deleted between the insert and the read; try again
        }

        Err(QueueError::Unavailable(format!(
            "enqueue of {job_id} kept racing with deletes"
        )))
    }

    // ----------------------------
    // Claiming
    // ----------------------------

    async fn claim_next(
        &self,
        categories: &[JobCategory],
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let categories: Vec<String> = categories.iter().map(|c| c.as_str().to_string()).collect();

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs j
            SET status = 'processing',
                claimed_by = $2,
                claim_token = $4,
                claimed_at = $3,
                updated_at = $3
            FROM (
              SELECT id
              FROM jobs
              WHERE category = ANY($1)
                AND (
                  status = 'pending'
                  OR (status = 'retrying' AND (next_attempt_at IS NULL OR next_attempt_at <= $3))
                )
              ORDER BY priority ASC, created_at ASC, seq ASC
              FOR UPDATE SKIP LOCKED
              LIMIT 1
            ) candidate
            WHERE j.id = candidate.id
            RETURNING j.*
            "#,
        )
        .bind(&categories)
        .bind(worker_id)
        .bind(now)
        .bind(Uuid::new_v4())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job_id = row.id.clone();
        match JobRecord::try_from(row) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "claimed job has an undecodable payload; failing it");
                self.fail_undecodable(&job_id, &e, now).await?;
                Ok(None)
            }
        }
    }

    // ----------------------------
    // Worker transitions
    // ----------------------------

    async fn mark_completed(
        &self,
        job_id: &str,
        claim_token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                attempt = attempt + 1,
                next_attempt_at = NULL,
                claimed_by = NULL,
                claim_token = NULL,
                completed_at = $3,
                updated_at = $3
            WHERE id = $1
              AND status = 'processing'
              AND claim_token = $2
            "#,
        )
        .bind(job_id)
        .bind(claim_token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn schedule_retry(
        &self,
        job_id: &str,
        claim_token: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &LastError,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'retrying',
                attempt = attempt + 1,
                next_attempt_at = $3,
                last_error_code = $4,
                last_error_message = $5,
                last_error_class = $6,
                last_error_at = $7,
                claimed_by = NULL,
                claim_token = NULL,
                updated_at = $7
            WHERE id = $1
              AND status = 'processing'
              AND claim_token = $2
            "#,
        )
        .bind(job_id)
        .bind(claim_token)
        .bind(next_attempt_at)
        .bind(&error.code)
        .bind(&error.message)
        .bind(error.classification.as_str())
        .bind(error.at)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        job_id: &str,
        claim_token: Uuid,
        reason: FailureReason,
        error: &LastError,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                attempt = attempt + 1,
                failure_reason = $3,
                next_attempt_at = NULL,
                last_error_code = $4,
                last_error_message = $5,
                last_error_class = $6,
                last_error_at = $7,
                claimed_by = NULL,
                claim_token = NULL,
                completed_at = $7,
                updated_at = $7
            WHERE id = $1
              AND status = 'processing'
              AND claim_token = $2
            "#,
        )
        .bind(job_id)
        .bind(claim_token)
        .bind(reason.as_str())
        .bind(&error.code)
        .bind(&error.message)
        .bind(error.classification.as_str())
        .bind(error.at)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // Stuck-job recovery
    // ----------------------------

    async fn reclaim_stuck(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Reclaimed> {
        let stuck = LastError::stuck(now);
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET attempt = attempt + 1,
                status = CASE WHEN attempt + 1 > max_attempts THEN 'failed' ELSE 'retrying' END,
                failure_reason = CASE WHEN attempt + 1 > max_attempts
                                      THEN 'MAX_ATTEMPTS_EXCEEDED' ELSE failure_reason END,
                next_attempt_at = CASE WHEN attempt + 1 > max_attempts THEN NULL ELSE $2 END,
                completed_at = CASE WHEN attempt + 1 > max_attempts THEN $2 ELSE completed_at END,
                last_error_code = $3,
                last_error_message = $4,
                last_error_class = $5,
                last_error_at = $2,
                claimed_by = NULL,
                claim_token = NULL,
                updated_at = $2
            WHERE status = 'processing'
              AND claimed_at < $1
            RETURNING *
            "#,
        )
        .bind(older_than)
        .bind(now)
        .bind(&stuck.code)
        .bind(&stuck.message)
        .bind(stuck.classification.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Reclaimed::default();
        for row in rows {
            if row.status != "failed" {
                out.retrying += 1;
                continue;
            }
            let job_id = row.id.clone();
            match JobRecord::try_from(row) {
                Ok(job) => out.failed.push(job),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "reclaimed job could not be decoded; skipping its failure hook")
                }
            }
        }

        Ok(out)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    async fn stats(&self, category: Option<JobCategory>, now: DateTime<Utc>) -> Result<QueueStats> {
        let category = category_filter(category);

        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM jobs
            WHERE ($1::text IS NULL OR category = $1)
            GROUP BY status
            "#,
        )
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, n) in rows {
            stats.add(status.parse().map_err(decode_err)?, n);
        }

        let oldest: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MIN(created_at)
            FROM jobs
            WHERE status = 'pending'
              AND ($1::text IS NULL OR category = $1)
            "#,
        )
        .bind(category)
        .fetch_one(&self.pool)
        .await?;

        stats.set_oldest_pending(oldest, now);
        Ok(stats)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter, limit: i64, skip: i64) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR subject_id = $2)
              AND ($3::text IS NULL OR category = $3)
            ORDER BY created_at DESC, seq DESC
            LIMIT $4
            OFFSET $5
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.subject_id.as_deref())
        .bind(category_filter(filter.category))
        .bind(limit.max(0))
        .bind(skip.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn count_jobs(&self, filter: &JobFilter) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR subject_id = $2)
              AND ($3::text IS NULL OR category = $3)
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.subject_id.as_deref())
        .bind(category_filter(filter.category))
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    // ----------------------------
    // Operator actions
    // ----------------------------

    async fn retry_failed(&self, job_id: &str) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempt = 0,
                next_attempt_at = NULL,
                last_error_code = NULL,
                last_error_message = NULL,
                last_error_class = NULL,
                last_error_at = NULL,
                failure_reason = NULL,
                claimed_by = NULL,
                claim_token = NULL,
                claimed_at = NULL,
                completed_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn retry_all_failed(&self, category: Option<JobCategory>) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempt = 0,
                next_attempt_at = NULL,
                last_error_code = NULL,
                last_error_message = NULL,
                last_error_class = NULL,
                last_error_at = NULL,
                failure_reason = NULL,
                claimed_by = NULL,
                claim_token = NULL,
                claimed_at = NULL,
                completed_at = NULL,
                updated_at = now()
            WHERE status = 'failed'
              AND ($1::text IS NULL OR category = $1)
            "#,
        )
        .bind(category_filter(category))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn cancel(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let cancelled = LastError::cancelled(now);
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                failure_reason = 'CANCELLED',
                next_attempt_at = NULL,
                last_error_code = $2,
                last_error_message = $3,
                last_error_class = $4,
                last_error_at = $5,
                completed_at = $5,
                updated_at = $5
            WHERE id = $1
              AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(job_id)
        .bind(&cancelled.code)
        .bind(&cancelled.message)
        .bind(cancelled.classification.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn delete_completed_before(
        &self,
        cutoff: DateTime<Utc>,
        category: Option<JobCategory>,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status = 'completed'
              AND completed_at < $1
              AND ($2::text IS NULL OR category = $2)
            "#,
        )
        .bind(cutoff)
        .bind(category_filter(category))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }
}
