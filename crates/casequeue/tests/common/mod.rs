#![allow(dead_code)]

use casequeue::jobs::model::{
    DocumentJob, FileData, JobPayload, JobRecord, WebhookJob, WebhookType,
};
use casequeue::jobs::registry::{HandlerRegistry, JobContext};
use casequeue::jobs::retry::RetryPolicy;
use casequeue::jobs::runner::JobRunner;
use casequeue::jobs::store::{JobStore, NewJob};
use casequeue::jobs::worker::{QueueWorker, WorkerConfig};
use casequeue::subjects::{EntityUpdateSerializer, MemorySubjectStore};
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connect to `TEST_DATABASE_URL`, migrate and truncate. Returns `None`
/// when the variable is unset so Postgres tests skip on machines without a
/// database.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping Postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE jobs, subjects RESTART IDENTITY CASCADE")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

pub fn document_payload(document_id: &str) -> JobPayload {
    JobPayload::DocumentProcessing(DocumentJob {
        document_id: document_id.to_string(),
        file: FileData {
            filename: format!("{document_id}.png"),
            gcs_path: None,
            local_path: Some(format!("/tmp/{document_id}.png")),
            mime_type: "image/png".to_string(),
            size: 2048,
        },
        client_name: Some("Test Client".to_string()),
        webhook_url: "http://localhost/webhooks/ai-processing".to_string(),
    })
}

pub fn webhook_payload(body: Value) -> JobPayload {
    JobPayload::WebhookDelivery(WebhookJob {
        webhook_type: WebhookType::PortalWebhook,
        body,
    })
}

pub fn document_job(subject: &str, document_id: &str) -> NewJob {
    NewJob::new(subject, document_payload(document_id))
}

pub fn webhook_job(subject: &str) -> NewJob {
    NewJob::new(subject, webhook_payload(json!({ "client_id": subject })))
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(
        chrono::Duration::milliseconds(10),
        chrono::Duration::milliseconds(100),
    )
}

pub fn memory_subjects() -> (MemorySubjectStore<Value>, EntityUpdateSerializer<Value>) {
    let store = MemorySubjectStore::<Value>::new();
    let serializer = EntityUpdateSerializer::<Value>::new(Arc::new(store.clone()));
    (store, serializer)
}

pub fn context(worker_id: &str) -> JobContext {
    JobContext {
        worker_id: worker_id.to_string(),
        subjects: memory_subjects().1,
    }
}

pub fn fast_worker_config(worker_id: &str, categories: Vec<casequeue::jobs::JobCategory>) -> WorkerConfig {
    let mut cfg = WorkerConfig::new(worker_id, categories);
    cfg.poll_interval = Duration::from_millis(10);
    cfg.shutdown_grace = Duration::from_secs(2);
    cfg
}

pub fn worker(
    cfg: WorkerConfig,
    store: Arc<dyn JobStore>,
    registry: HandlerRegistry,
) -> QueueWorker {
    let runner = JobRunner::new(store.clone(), fast_policy());
    let ctx = context(&cfg.worker_id);
    QueueWorker::new(cfg, store, runner, Arc::new(registry), ctx)
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if check().await {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn job(store: &dyn JobStore, id: &str) -> JobRecord {
    store
        .get_job(id)
        .await
        .expect("get_job failed")
        .expect("job missing")
}
