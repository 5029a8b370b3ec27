// tests/store_semantics.rs
mod common;

use casequeue::jobs::model::{
    ErrorClass, FailureReason, JobCategory, JobRecord, JobStatus, LastError,
};
use casequeue::jobs::store::{JobFilter, JobStore};
use casequeue::jobs::MemoryJobStore;
use chrono::{Duration, Utc};
use common::{document_job, job, webhook_job};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

const ALL: [JobCategory; 2] = JobCategory::ALL;

fn token(job: &JobRecord) -> Uuid {
    job.claim_token.expect("claimed job carries a token")
}

fn timeout_error() -> LastError {
    LastError::new("TIMEOUT", "simulated timeout", ErrorClass::Retryable, Utc::now())
}

#[tokio::test]
async fn enqueue_with_same_key_is_idempotent() {
    let store = MemoryJobStore::new();

    let first = store
        .enqueue(document_job("client-1", "doc-1").key("doc-1"))
        .await
        .unwrap();
    let second = store
        .enqueue(document_job("client-1", "doc-1").key("doc-1"))
        .await
        .unwrap();

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.job_id, second.job_id);
    assert_eq!(store.count_jobs(&JobFilter::default()).await.unwrap(), 1);
}

#[tokio::test]
async fn enqueue_after_completion_is_a_noop() {
    let store = MemoryJobStore::new();
    store
        .enqueue(document_job("client-1", "doc-1").key("doc-1"))
        .await
        .unwrap();

    let claimed = store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().unwrap();
    assert!(store.mark_completed(&claimed.id, token(&claimed), Utc::now()).await.unwrap());

    let again = store
        .enqueue(document_job("client-1", "doc-1").key("doc-1"))
        .await
        .unwrap();
    assert!(again.deduplicated);
    assert_eq!(again.status, JobStatus::Completed);
    assert_eq!(job(&store, "doc-1").await.status, JobStatus::Completed);
}

#[tokio::test]
async fn generated_ids_carry_category_prefix() {
    let store = MemoryJobStore::new();
    let doc = store.enqueue(document_job("c", "d")).await.unwrap();
    let wh = store.enqueue(webhook_job("c")).await.unwrap();
    assert!(doc.job_id.starts_with("docjob_"));
    assert!(wh.job_id.starts_with("whjob_"));
}

#[tokio::test]
async fn claim_orders_by_priority_then_fifo() {
    let store = MemoryJobStore::new();
    store.enqueue(document_job("c", "a").key("low-1").priority(5)).await.unwrap();
    store.enqueue(document_job("c", "b").key("low-2").priority(5)).await.unwrap();
    store.enqueue(document_job("c", "c").key("high").priority(1)).await.unwrap();

    let mut order = Vec::new();
    while let Some(j) = store.claim_next(&ALL, "w1", Utc::now()).await.unwrap() {
        order.push(j.id);
    }
    assert_eq!(order, vec!["high", "low-1", "low-2"]);
}

#[tokio::test]
async fn claim_respects_categories() {
    let store = MemoryJobStore::new();
    store.enqueue(webhook_job("c").key("wh")).await.unwrap();

    let none = store
        .claim_next(&[JobCategory::DocumentProcessing], "w1", Utc::now())
        .await
        .unwrap();
    assert!(none.is_none());

    let got = store
        .claim_next(&[JobCategory::WebhookDelivery], "w1", Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.id, "wh");
    assert_eq!(got.status, JobStatus::Processing);
    assert_eq!(got.claimed_by.as_deref(), Some("w1"));
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_a_job_twice() {
    let store = Arc::new(MemoryJobStore::new());
    for i in 0..10 {
        store
            .enqueue(document_job("c", &format!("d{i}")).key(format!("job-{i}")))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_next(&ALL, &format!("w{w}"), Utc::now())
                .await
                .unwrap()
        }));
    }

    let mut seen = HashSet::new();
    let mut claimed = 0;
    for h in handles {
        if let Some(j) = h.await.unwrap() {
            claimed += 1;
            assert!(seen.insert(j.id.clone()), "job {} claimed twice", j.id);
        }
    }
    assert_eq!(claimed, 10);
}

#[tokio::test]
async fn retrying_job_waits_for_next_attempt_at() {
    let store = MemoryJobStore::new();
    store.enqueue(document_job("c", "d").key("j")).await.unwrap();
    let j = store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().unwrap();

    let next = Utc::now() + Duration::seconds(30);
    assert!(store.schedule_retry(&j.id, token(&j), next, &timeout_error()).await.unwrap());

    let early = store.claim_next(&ALL, "w1", Utc::now()).await.unwrap();
    assert!(early.is_none());

    let later = store
        .claim_next(&ALL, "w1", next + Duration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(later.id, "j");
    assert_eq!(later.attempt, 1);
}

#[tokio::test]
async fn transitions_require_the_claiming_worker() {
    let store = MemoryJobStore::new();
    store.enqueue(document_job("c", "d").key("j")).await.unwrap();
    let owned = store.claim_next(&ALL, "owner", Utc::now()).await.unwrap().unwrap();
    let intruder = Uuid::new_v4();

    assert!(!store.mark_completed("j", intruder, Utc::now()).await.unwrap());
    assert!(!store
        .mark_failed("j", intruder, FailureReason::NonRetryable, &timeout_error())
        .await
        .unwrap());
    assert_eq!(job(&store, "j").await.status, JobStatus::Processing);

    assert!(store.mark_completed("j", token(&owned), Utc::now()).await.unwrap());
    // a second completion is ignored
    assert!(!store.mark_completed("j", token(&owned), Utc::now()).await.unwrap());
    let done = job(&store, "j").await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempt, 1);
}

#[tokio::test]
async fn stale_token_from_same_worker_is_rejected_after_reclaim() {
    let store = MemoryJobStore::new();
    store.enqueue(document_job("c", "d").key("j")).await.unwrap();

    // first attempt hangs past the timeout
    let first = store
        .claim_next(&ALL, "w-documents", Utc::now() - Duration::minutes(20))
        .await
        .unwrap()
        .unwrap();
    let now = Utc::now();
    let reclaimed = store
        .reclaim_stuck(now - Duration::minutes(10), now)
        .await
        .unwrap();
    assert_eq!(reclaimed.retrying, 1);

    // the same worker picks the job up again
    let second = store
        .claim_next(&ALL, "w-documents", Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.claimed_by, first.claimed_by);
    assert_ne!(second.claim_token, first.claim_token);

    // the hung first attempt finally reports; it must not touch the new claim
    assert!(!store.mark_completed("j", token(&first), Utc::now()).await.unwrap());
    assert!(!store
        .schedule_retry("j", token(&first), Utc::now(), &timeout_error())
        .await
        .unwrap());
    let live = job(&store, "j").await;
    assert_eq!(live.status, JobStatus::Processing);
    assert_eq!(live.attempt, 1);
    assert_eq!(live.claim_token, second.claim_token);

    assert!(store.mark_completed("j", token(&second), Utc::now()).await.unwrap());
    let done = job(&store, "j").await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempt, 2);
    assert!(done.claim_token.is_none());
}

#[tokio::test]
async fn cancel_only_from_pending_or_retrying() {
    let store = MemoryJobStore::new();
    store.enqueue(document_job("c", "a").key("pending")).await.unwrap();
    store.enqueue(document_job("c", "b").key("running").priority(0)).await.unwrap();
    store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().unwrap();

    assert!(!store.cancel("running", Utc::now()).await.unwrap());
    assert!(store.cancel("pending", Utc::now()).await.unwrap());
    assert!(!store.cancel("missing", Utc::now()).await.unwrap());

    let cancelled = job(&store, "pending").await;
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.failure_reason, Some(FailureReason::Cancelled));
    let err = cancelled.last_error.unwrap();
    assert_eq!(err.classification, ErrorClass::Cancelled);
    assert_eq!(err.code, "CANCELLED");

    // cancelled jobs are never claimed
    assert!(store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
async fn retry_resets_only_failed_jobs() {
    let store = MemoryJobStore::new();
    store.enqueue(document_job("c", "a").key("f")).await.unwrap();
    store.enqueue(document_job("c", "b").key("p").priority(9)).await.unwrap();

    let j = store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().unwrap();
    assert_eq!(j.id, "f");
    store
        .mark_failed("f", token(&j), FailureReason::NonRetryable, &timeout_error())
        .await
        .unwrap();

    assert!(!store.retry_failed("p").await.unwrap());
    assert!(store.retry_failed("f").await.unwrap());

    let reset = job(&store, "f").await;
    assert_eq!(reset.status, JobStatus::Pending);
    assert_eq!(reset.attempt, 0);
    assert!(reset.last_error.is_none());
    assert!(reset.failure_reason.is_none());
}

#[tokio::test]
async fn retry_all_failed_honours_category() {
    let store = MemoryJobStore::new();
    store.enqueue(document_job("c", "a").key("doc")).await.unwrap();
    store.enqueue(webhook_job("c").key("wh")).await.unwrap();
    for _ in 0..2 {
        let j = store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().unwrap();
        store
            .mark_failed(&j.id, token(&j), FailureReason::NonRetryable, &timeout_error())
            .await
            .unwrap();
    }

    assert_eq!(
        store
            .retry_all_failed(Some(JobCategory::WebhookDelivery))
            .await
            .unwrap(),
        1
    );
    assert_eq!(job(&store, "doc").await.status, JobStatus::Failed);
    assert_eq!(job(&store, "wh").await.status, JobStatus::Pending);
    assert_eq!(store.retry_all_failed(None).await.unwrap(), 1);
}

#[tokio::test]
async fn cleanup_deletes_only_old_completed_jobs() {
    let store = MemoryJobStore::new();
    store.enqueue(document_job("c", "a").key("done")).await.unwrap();
    store.enqueue(document_job("c", "b").key("failed")).await.unwrap();
    store.enqueue(document_job("c", "c").key("pending").priority(9)).await.unwrap();

    let a = store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().unwrap();
    store.mark_completed(&a.id, token(&a), Utc::now()).await.unwrap();
    let b = store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().unwrap();
    store
        .mark_failed(&b.id, token(&b), FailureReason::NonRetryable, &timeout_error())
        .await
        .unwrap();

    // cutoff in the past: nothing is old enough
    let n = store
        .delete_completed_before(Utc::now() - Duration::hours(1), None)
        .await
        .unwrap();
    assert_eq!(n, 0);

    let n = store
        .delete_completed_before(Utc::now() + Duration::seconds(1), None)
        .await
        .unwrap();
    assert_eq!(n, 1);
    assert!(store.get_job("done").await.unwrap().is_none());
    assert!(store.get_job("failed").await.unwrap().is_some());
    assert!(store.get_job("pending").await.unwrap().is_some());
}

#[tokio::test]
async fn stats_count_statuses_and_oldest_pending() {
    let store = MemoryJobStore::new();
    store.enqueue(document_job("c", "a").key("one")).await.unwrap();
    store.enqueue(document_job("c", "b").key("two")).await.unwrap();
    store.enqueue(webhook_job("c").key("three")).await.unwrap();
    store
        .claim_next(&[JobCategory::WebhookDelivery], "w1", Utc::now())
        .await
        .unwrap()
        .unwrap();

    let now = Utc::now() + Duration::seconds(5);
    let all = store.stats(None, now).await.unwrap();
    assert_eq!(all.pending, 2);
    assert_eq!(all.processing, 1);
    assert_eq!(all.in_flight, 1);
    assert_eq!(all.total, 3);
    assert!(all.oldest_pending_age_ms.unwrap() >= 5_000);

    let wh = store
        .stats(Some(JobCategory::WebhookDelivery), now)
        .await
        .unwrap();
    assert_eq!(wh.pending, 0);
    assert_eq!(wh.processing, 1);
    assert!(wh.oldest_pending_at.is_none());
}

#[tokio::test]
async fn list_filters_by_subject_and_pages_newest_first() {
    let store = MemoryJobStore::new();
    for i in 0..5 {
        store
            .enqueue(document_job("client-a", &format!("d{i}")).key(format!("a{i}")))
            .await
            .unwrap();
    }
    store.enqueue(document_job("client-b", "x").key("b0")).await.unwrap();

    let filter = JobFilter {
        subject_id: Some("client-a".into()),
        ..JobFilter::default()
    };
    assert_eq!(store.count_jobs(&filter).await.unwrap(), 5);

    let page: Vec<String> = store
        .list_jobs(&filter, 2, 1)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(page, vec!["a3", "a2"]);
}

#[tokio::test]
async fn offline_store_fails_loudly() {
    let store = MemoryJobStore::new();
    store.set_offline(true);
    let err = store.enqueue(document_job("c", "d")).await.unwrap_err();
    assert!(err.is_storage());
    store.set_offline(false);
    assert!(store.enqueue(document_job("c", "d")).await.is_ok());
}
