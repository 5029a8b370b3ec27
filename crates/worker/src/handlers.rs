use crate::clients;
use casequeue::jobs::error_codes::ErrorCode;
use casequeue::jobs::model::{JobCategory, JobRecord, WebhookType};
use casequeue::jobs::registry::{
    boxed, document_payload, webhook_payload, HandlerOptions, HandlerRegistry, JobContext,
    JobError,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info};

/// Client for the document extraction service. Without a base URL the
/// submission step is skipped, which is how local and test runs behave.
#[derive(Clone)]
pub struct AiClient {
    http: reqwest::Client,
    base_url: Option<String>,
}

impl AiClient {
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("CASEQUEUE_AI_SERVICE_URL")
            .or_else(|_| std::env::var("FASTAPI_URL"))
            .ok()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        let timeout_ms: u64 = std::env::var("FASTAPI_CONNECTION_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10_000);

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(timeout_ms))
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self { http, base_url })
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }

    async fn submit(&self, job: &JobRecord, body: Value) -> Result<(), JobError> {
        let Some(base) = &self.base_url else {
            debug!(job_id = %job.id, "ai service not configured, skipping submission");
            return Ok(());
        };

        let resp = self
            .http
            .post(format!("{base}/processing/jobs"))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let text = resp.text().await.unwrap_or_default();
        Err(status_error(status.as_u16(), &text))
    }
}

fn transport_error(e: reqwest::Error) -> JobError {
    if e.is_timeout() {
        JobError::coded(ErrorCode::Timeout, format!("ai service timeout: {e}"))
    } else if e.is_connect() {
        JobError::coded(ErrorCode::ConnectionRefused, format!("ai service unreachable: {e}"))
    } else {
        JobError::uncoded(format!("fetch failed: {e}"))
    }
}

fn status_error(status: u16, body: &str) -> JobError {
    let msg = format!("ai service returned {status}: {body}");
    match status {
        429 => JobError::coded(ErrorCode::RateLimit, msg),
        500..=599 => JobError::coded(ErrorCode::UpstreamUnavailable, msg),
        _ => JobError::coded(ErrorCode::Rejected, msg),
    }
}

async fn process_document(ai: &AiClient, job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
    let doc = document_payload(job)?;
    if doc.file.local_path.is_none() && doc.file.gcs_path.is_none() {
        return Err(JobError::coded(
            ErrorCode::BadPayload,
            format!("document {} has neither local_path nor gcs_path", doc.document_id),
        ));
    }

    ai.submit(
        job,
        json!({
            "job_id": job.id,
            "client_id": job.subject_id,
            "client_name": doc.client_name,
            "document_id": doc.document_id,
            "file": doc.file,
            "webhook_url": doc.webhook_url,
            "attempt": job.attempt + 1,
        }),
    )
    .await?;

    let document_id = doc.document_id.clone();
    let now = Utc::now();
    ctx.subjects
        .update(&job.subject_id, move |client| {
            clients::mark_document_processing(client, &document_id, now)
        })
        .await?;

    info!(job_id = %job.id, document_id = %doc.document_id, "document handed to ai service");
    Ok(())
}

async fn deliver_webhook(job: &JobRecord, ctx: &JobContext) -> Result<(), JobError> {
    let wh = webhook_payload(job)?;
    let now = Utc::now();

    match wh.webhook_type {
        WebhookType::AiProcessing => {
            let document_id = wh
                .body
                .get("document_id")
                .and_then(Value::as_str)
                .ok_or_else(|| JobError::coded(ErrorCode::BadPayload, "ai-processing webhook without document_id"))?
                .to_string();
            let result = wh.body.get("result").cloned().unwrap_or(Value::Null);

            let doc_id = document_id.clone();
            let saved = ctx
                .subjects
                .update(&job.subject_id, move |client| {
                    clients::apply_ai_result(client, &doc_id, &result, now).map(|_| ())
                })
                .await?;

            let creditors = saved
                .get("final_creditor_list")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            info!(job_id = %job.id, document_id = %document_id, creditors, "ai result applied");
        }
        WebhookType::Deduplication | WebhookType::PortalWebhook => {
            let kind = match wh.webhook_type {
                WebhookType::Deduplication => "deduplication",
                _ => "portal-webhook",
            };
            let body = wh.body.clone();
            ctx.subjects
                .update(&job.subject_id, move |client| {
                    clients::record_webhook_event(client, kind, &body, now)
                })
                .await?;
            info!(job_id = %job.id, kind, "webhook event recorded");
        }
    }
    Ok(())
}

async fn document_failed(job: &JobRecord, err: &JobError, ctx: &JobContext) {
    let Ok(doc) = document_payload(job) else {
        return;
    };
    let document_id = doc.document_id.clone();
    let message = err.message.clone();
    let now = Utc::now();

    let res = ctx
        .subjects
        .update(&job.subject_id, move |client| {
            clients::mark_document_failed(client, &document_id, &message, now)
        })
        .await;

    if let Err(e) = res {
        error!(job_id = %job.id, document_id = %doc.document_id, error = %e, "could not mark document failed");
    }
}

pub fn build_registry(ai: AiClient, document_timeout: Duration, webhook_timeout: Duration) -> Arc<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    let ai = Arc::new(ai);

    registry.register_with_options(
        JobCategory::DocumentProcessing,
        move |job, ctx| {
            let ai = ai.clone();
            boxed(async move { process_document(&ai, job, ctx).await })
        },
        HandlerOptions::new()
            .timeout(document_timeout)
            .on_failed(|job, err, ctx| boxed(document_failed(job, err, ctx))),
    );

    registry.register_with_options(
        JobCategory::WebhookDelivery,
        |job, ctx| boxed(deliver_webhook(job, ctx)),
        HandlerOptions::new().timeout(webhook_timeout),
    );

    Arc::new(registry)
}
