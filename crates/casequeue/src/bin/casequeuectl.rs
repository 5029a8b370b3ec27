use anyhow::{anyhow, Context};
use casequeue::db;
use casequeue::jobs::model::{
    DocumentJob, FileData, JobCategory, JobPayload, JobStatus, WebhookJob, WebhookType,
};
use casequeue::jobs::store::{JobFilter, JobStore, NewJob};
use casequeue::jobs::{cutoff_days, PgJobStore};
use chrono::Utc;
use serde_json::json;
use std::env;

const USAGE: &str = "casequeuectl <command>\n\
Commands:\n\
  - migrate\n\
  - stats [category]\n\
  - list [status] [limit]\n\
  - show <job_id>\n\
  - retry <job_id>\n\
  - cancel <job_id>\n\
  - retry-all-failed [category]\n\
  - cleanup [older_than_days]\n\
  - seed <n>\n\
\n\
Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        eprint!("{USAGE}");
        std::process::exit(2);
    };

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .context("DATABASE_URL or TEST_DATABASE_URL must be set")?;

    let settings = db::PoolSettings::from_env().application_name("casequeuectl");
    let pool = db::make_pool(&url, &settings).await?;
    let store = PgJobStore::new(pool.clone());
    let arg = |i: usize| args.get(i).map(String::as_str);

    match command.as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        "stats" => {
            let category = arg(2).map(str::parse::<JobCategory>).transpose().map_err(|e| anyhow!(e))?;
            let stats = store.stats(category, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "list" => {
            let status = arg(2).map(str::parse::<JobStatus>).transpose().map_err(|e| anyhow!(e))?;
            let limit: i64 = arg(3).and_then(|s| s.parse().ok()).unwrap_or(20);
            let filter = JobFilter {
                status,
                ..JobFilter::default()
            };
            for job in store.list_jobs(&filter, limit, 0).await? {
                println!(
                    "{}  {:<20} {:<10} prio={} attempt={}/{} subject={}",
                    job.id,
                    job.category(),
                    job.status,
                    job.priority,
                    job.attempt,
                    job.max_attempts,
                    job.subject_id
                );
            }
        }
        "show" => {
            let id = arg(2).ok_or_else(|| anyhow!("usage: casequeuectl show <job_id>"))?;
            match store.get_job(id).await? {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => {
                    eprintln!("job {id} not found");
                    std::process::exit(1);
                }
            }
        }
        "retry" => {
            let id = arg(2).ok_or_else(|| anyhow!("usage: casequeuectl retry <job_id>"))?;
            if store.retry_failed(id).await? {
                println!("job {id} reset to pending");
            } else {
                eprintln!("job {id} not found or not failed");
                std::process::exit(1);
            }
        }
        "cancel" => {
            let id = arg(2).ok_or_else(|| anyhow!("usage: casequeuectl cancel <job_id>"))?;
            if store.cancel(id, Utc::now()).await? {
                println!("job {id} cancelled");
            } else {
                eprintln!("job {id} not found or not pending/retrying");
                std::process::exit(1);
            }
        }
        "retry-all-failed" => {
            let category = arg(2).map(str::parse::<JobCategory>).transpose().map_err(|e| anyhow!(e))?;
            let n = store.retry_all_failed(category).await?;
            println!("reset {n} failed job(s)");
        }
        "cleanup" => {
            let days: i64 = arg(2).and_then(|s| s.parse().ok()).unwrap_or(1);
            let n = store.delete_completed_before(cutoff_days(days), None).await?;
            println!("deleted {n} completed job(s) older than {days} day(s)");
        }
        "seed" => {
            let n: usize = arg(2).and_then(|s| s.parse().ok()).unwrap_or(10);
            seed(&store, n).await?;
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprint!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn seed(store: &PgJobStore, n: usize) -> anyhow::Result<()> {
    for i in 0..n {
        let subject = format!("client-{}", i % 3);
        let payload = if i % 2 == 0 {
            JobPayload::DocumentProcessing(DocumentJob {
                document_id: format!("doc-{i}"),
                file: FileData {
                    filename: format!("scan-{i}.png"),
                    gcs_path: None,
                    local_path: Some(format!("/tmp/uploads/scan-{i}.png")),
                    mime_type: "image/png".to_string(),
                    size: 1024,
                },
                client_name: Some(subject.clone()),
                webhook_url: "http://localhost:3000/webhooks/ai-processing".to_string(),
            })
        } else {
            JobPayload::WebhookDelivery(WebhookJob {
                webhook_type: WebhookType::AiProcessing,
                body: json!({ "client_id": subject, "document_id": format!("doc-{}", i - 1) }),
            })
        };

        let outcome = store.enqueue(NewJob::new(subject, payload)).await?;
        println!("+ enqueued {}", outcome.job_id);
    }
    Ok(())
}
