// tests/api.rs
mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use casequeue::api::{router, ApiState};
use casequeue::jobs::model::{JobCategory, JobStatus};
use casequeue::jobs::store::JobStore;
use casequeue::jobs::{Enqueuer, ErrorClass, FailureReason, LastError, MemoryJobStore};
use chrono::Utc;
use common::{document_job, job, webhook_job};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const ALL: [JobCategory; 2] = JobCategory::ALL;

fn app(store: &Arc<MemoryJobStore>, token: Option<&str>) -> Router {
    router(ApiState {
        store: store.clone(),
        enqueuer: Enqueuer::new(store.clone(), 1024),
        workers: Vec::new(),
        api_token: token.map(str::to_string),
    })
}

async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let res = app.oneshot(req.body(body).unwrap()).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Claim and fail the next job permanently.
async fn fail_next(store: &MemoryJobStore) -> String {
    let claimed = store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().unwrap();
    let err = LastError::new("REJECTED", "bad document", ErrorClass::Permanent, Utc::now());
    store
        .mark_failed(&claimed.id, claimed.claim_token.unwrap(), FailureReason::NonRetryable, &err)
        .await
        .unwrap();
    claimed.id
}

#[tokio::test]
async fn stats_reports_counts_per_status_and_category() {
    let store = Arc::new(MemoryJobStore::new());
    store.enqueue(document_job("c1", "d1").key("d1")).await.unwrap();
    store.enqueue(document_job("c1", "d2").key("d2")).await.unwrap();
    store.enqueue(webhook_job("c2").key("w1").priority(9)).await.unwrap();
    fail_next(&store).await;

    let (status, body) = call(app(&store, None), Method::GET, "/queue/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue"]["total"], 3);
    assert_eq!(body["queue"]["pending"], 2);
    assert_eq!(body["queue"]["failed"], 1);

    let by_cat = body["by_category"].as_array().unwrap();
    assert_eq!(by_cat.len(), 2);
    let docs = by_cat
        .iter()
        .find(|c| c["category"] == "document-processing")
        .unwrap();
    assert_eq!(docs["total"], 2);

    let (status, body) = call(
        app(&store, None),
        Method::GET,
        "/queue/stats?category=webhook-delivery",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue"]["total"], 1);

    let (status, _) = call(app(&store, None), Method::GET, "/queue/stats?category=nope", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_filters_by_status_and_subject() {
    let store = Arc::new(MemoryJobStore::new());
    store.enqueue(document_job("alice", "d1").key("a1")).await.unwrap();
    store.enqueue(document_job("alice", "d2").key("a2")).await.unwrap();
    store.enqueue(document_job("bob", "d3").key("b1")).await.unwrap();
    let failed = fail_next(&store).await;
    assert_eq!(failed, "a1");

    let (status, body) = call(
        app(&store, None),
        Method::GET,
        "/queue/jobs?subjectId=alice",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["limit"], 50);

    let (_, body) = call(
        app(&store, None),
        Method::GET,
        "/queue/jobs?status=failed",
        None,
    )
    .await;
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], "a1");
    assert_eq!(items[0]["category"], "document-processing");

    let (_, body) = call(
        app(&store, None),
        Method::GET,
        "/queue/jobs?status=pending&limit=1&skip=0",
        None,
    )
    .await;
    assert_eq!(body["total"], 2);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    let (status, _) = call(app(&store, None), Method::GET, "/queue/jobs?status=weird", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_job_and_missing_job() {
    let store = Arc::new(MemoryJobStore::new());
    store.enqueue(document_job("c", "d").key("doc-1")).await.unwrap();

    let (status, body) = call(app(&store, None), Method::GET, "/queue/jobs/doc-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "doc-1");
    assert_eq!(body["status"], "pending");
    assert_eq!(body["payload"]["document_id"], "d");

    let (status, body) = call(app(&store, None), Method::GET, "/queue/jobs/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn retry_only_applies_to_failed_jobs() {
    let store = Arc::new(MemoryJobStore::new());
    store.enqueue(document_job("c", "d1").key("f")).await.unwrap();
    store.enqueue(document_job("c", "d2").key("p")).await.unwrap();
    fail_next(&store).await;

    let (status, body) = call(app(&store, None), Method::POST, "/queue/jobs/f/retry", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "pending");

    let reset = job(store.as_ref(), "f").await;
    assert_eq!(reset.status, JobStatus::Pending);
    assert_eq!(reset.attempt, 0);
    assert_eq!(reset.last_error, None);

    let (status, _) = call(app(&store, None), Method::POST, "/queue/jobs/p/retry", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(app(&store, None), Method::POST, "/queue/jobs/ghost/retry", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_pending_job() {
    let store = Arc::new(MemoryJobStore::new());
    store.enqueue(document_job("c", "d1").key("running").priority(1)).await.unwrap();
    store.enqueue(document_job("c", "d2").key("waiting")).await.unwrap();
    store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().unwrap();

    let (status, body) = call(app(&store, None), Method::POST, "/queue/jobs/waiting/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");

    let cancelled = job(store.as_ref(), "waiting").await;
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.last_error.unwrap().code, "CANCELLED");

    let (status, _) = call(app(&store, None), Method::POST, "/queue/jobs/running/cancel", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn retry_all_failed_resets_every_failed_job() {
    let store = Arc::new(MemoryJobStore::new());
    for i in 0..3 {
        store
            .enqueue(document_job("c", &format!("d{i}")).key(format!("j{i}")))
            .await
            .unwrap();
    }
    fail_next(&store).await;
    fail_next(&store).await;

    let (status, body) = call(app(&store, None), Method::POST, "/queue/retry-all-failed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reset"], 2);
    assert_eq!(store.stats(None, Utc::now()).await.unwrap().pending, 3);
}

#[tokio::test]
async fn cleanup_removes_old_completed_jobs() {
    let store = Arc::new(MemoryJobStore::new());
    store.enqueue(document_job("c", "d").key("done")).await.unwrap();
    let claimed = store.claim_next(&ALL, "w1", Utc::now()).await.unwrap().unwrap();
    store
        .mark_completed(&claimed.id, claimed.claim_token.unwrap(), Utc::now() - chrono::Duration::days(3))
        .await
        .unwrap();

    // completed three days ago: kept by a seven-day cleanup, removed by the one-day default
    let (status, body) = call(
        app(&store, None),
        Method::POST,
        "/queue/cleanup",
        Some(json!({ "olderThanDays": 7 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 0);

    let (status, body) = call(app(&store, None), Method::POST, "/queue/cleanup", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], 1);
    assert!(store.get_job("done").await.unwrap().is_none());

    let (status, _) = call(
        app(&store, None),
        Method::POST,
        "/queue/cleanup",
        Some(json!({ "olderThanDays": -1 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn enqueue_over_http_is_idempotent_and_size_checked() {
    let store = Arc::new(MemoryJobStore::new());
    let request = json!({
        "key": "doc-7",
        "subject_id": "client-7",
        "category": "document-processing",
        "payload": {
            "document_id": "doc-7",
            "file": { "filename": "scan.pdf", "mime_type": "application/pdf" },
            "webhook_url": "http://localhost/hook"
        },
        "priority": 2
    });

    let (status, body) = call(app(&store, None), Method::POST, "/queue/jobs", Some(request.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["job_id"], "doc-7");
    assert_eq!(body["deduplicated"], false);

    let (status, body) = call(app(&store, None), Method::POST, "/queue/jobs", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deduplicated"], true);
    assert_eq!(job(store.as_ref(), "doc-7").await.priority, 2);

    let oversized = json!({
        "subject_id": "client-7",
        "category": "webhook-delivery",
        "payload": {
            "webhook_type": "portal-webhook",
            "body": { "blob": "x".repeat(4096) }
        }
    });
    let (status, _) = call(app(&store, None), Method::POST, "/queue/jobs", Some(oversized)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn token_guards_queue_routes_but_not_health() {
    let store = Arc::new(MemoryJobStore::new());

    let (status, _) = call(app(&store, Some("s3cret")), Method::GET, "/queue/stats", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .uri("/queue/stats")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    let res = app(&store, Some("s3cret")).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let res = app(&store, Some("s3cret")).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn unavailable_store_maps_to_503() {
    let store = Arc::new(MemoryJobStore::new());
    store.set_offline(true);
    let (status, _) = call(app(&store, None), Method::GET, "/queue/stats", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
