use casequeue::api;
use casequeue::config;
use casequeue::db;
use casequeue::telemetry;

use casequeue::jobs::guard::Enqueuer;
use casequeue::jobs::maintenance::RetentionSweeper;
use casequeue::jobs::model::JobCategory;
use casequeue::jobs::registry::JobContext;
use casequeue::jobs::runner::JobRunner;
use casequeue::jobs::store::JobStore;
use casequeue::jobs::worker::QueueWorker;
use casequeue::jobs::PgJobStore;
use casequeue::subjects::{EntityUpdateSerializer, PgSubjectStore};

use std::sync::Arc;
use tracing::{error, info};

mod clients;
mod handlers;
use handlers::{build_registry, AiClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init("casequeue-worker");

    info!(
        worker_id = %cfg.worker_id,
        api = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        auth = if cfg.api_token.is_some() { "enabled" } else { "disabled" },
        migrate_on_startup = cfg.migrate_on_startup,
        retention_interval_secs = cfg.retention_interval.as_secs(),
        "casequeue worker starting"
    );

    let pool = db::make_pool(&cfg.database_url, &cfg.pool).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
    let subjects = EntityUpdateSerializer::<serde_json::Value>::new(Arc::new(
        PgSubjectStore::new(pool.clone()),
    ));

    let ai = AiClient::from_env()?;
    if !ai.is_configured() {
        info!("CASEQUEUE_AI_SERVICE_URL not set, documents are marked processing without submission");
    }
    let registry = build_registry(
        ai,
        cfg.document.handler_timeout(),
        cfg.webhook.handler_timeout(),
    );

    let runner = JobRunner::new(store.clone(), cfg.document.retry_policy())
        .with_policy(JobCategory::DocumentProcessing, cfg.document.retry_policy())
        .with_policy(JobCategory::WebhookDelivery, cfg.webhook.retry_policy());

    let ctx = JobContext {
        worker_id: cfg.worker_id.clone(),
        subjects,
    };

    let workers: Vec<QueueWorker> = [
        (JobCategory::DocumentProcessing, "documents"),
        (JobCategory::WebhookDelivery, "webhooks"),
    ]
    .into_iter()
    .map(|(category, suffix)| {
        QueueWorker::new(
            cfg.queue(category).worker_config(
                format!("{}-{suffix}", cfg.worker_id),
                category,
                cfg.shutdown_grace,
            ),
            store.clone(),
            runner.clone(),
            registry.clone(),
            ctx.clone(),
        )
    })
    .collect();

    for w in &workers {
        w.start();
    }

    // ---- API task ----
    let api_state = api::ApiState {
        store: store.clone(),
        enqueuer: Enqueuer::new(store.clone(), cfg.max_payload_bytes)
            .with_max_attempts(JobCategory::DocumentProcessing, cfg.document.max_attempts)
            .with_max_attempts(JobCategory::WebhookDelivery, cfg.webhook.max_attempts),
        workers: workers.clone(),
        api_token: cfg.api_token.clone(),
    };
    let app = api::router(api_state);
    let api_addr = cfg.admin_addr.clone();

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!("admin api listening on http://{addr}");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Retention task ----
    let retention_handle = tokio::spawn(RetentionSweeper::new(store.clone()).run(cfg.retention_interval));

    let result = tokio::select! {
        res = api_handle => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(e.into()),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!(error = %e, "admin api failed, shutting down");
    }

    retention_handle.abort();
    stop_workers(&workers).await;
    info!("casequeue worker stopped");

    result
}

async fn stop_workers(workers: &[QueueWorker]) {
    let mut set = tokio::task::JoinSet::new();
    for w in workers {
        let w = w.clone();
        set.spawn(async move { w.stop().await });
    }
    while set.join_next().await.is_some() {}
}
