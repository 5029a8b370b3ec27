use crate::db::PoolSettings;
use crate::jobs::guard::DEFAULT_MAX_PAYLOAD_BYTES;
use crate::jobs::model::JobCategory;
use crate::jobs::retry::RetryPolicy;
use crate::jobs::worker::WorkerConfig;
use std::time::Duration;

/// Tuning for one queue worker. Legacy variable names from the previous
/// deployment are still honoured as fallbacks.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub max_attempts: i32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub job_timeout: Duration,
}

impl QueueSettings {
    pub fn document_defaults() -> Self {
        Self {
            max_concurrent: 2,
            poll_interval: Duration::from_millis(2000),
            max_attempts: 3,
            base_retry_delay: Duration::from_secs(30),
            max_retry_delay: Duration::from_secs(5 * 60),
            job_timeout: Duration::from_secs(10 * 60),
        }
    }

    pub fn webhook_defaults() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval: Duration::from_millis(5000),
            max_attempts: 3,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            job_timeout: Duration::from_secs(10 * 60),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            chrono::Duration::milliseconds(self.base_retry_delay.as_millis() as i64),
            chrono::Duration::milliseconds(self.max_retry_delay.as_millis() as i64),
        )
    }

    /// Handlers must give up before the reaper treats their claim as stuck;
    /// keep a tenth of the job timeout (at most a minute) as headroom.
    pub fn handler_timeout(&self) -> Duration {
        let headroom = (self.job_timeout / 10).min(Duration::from_secs(60));
        self.job_timeout.saturating_sub(headroom.max(Duration::from_millis(1)))
    }

    pub fn worker_config(
        &self,
        worker_id: impl Into<String>,
        category: JobCategory,
        shutdown_grace: Duration,
    ) -> WorkerConfig {
        WorkerConfig {
            worker_id: worker_id.into(),
            categories: vec![category],
            max_concurrent: self.max_concurrent,
            poll_interval: self.poll_interval,
            job_timeout: self.job_timeout,
            shutdown_grace,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub pool: PoolSettings,
    pub worker_id: String,
    pub admin_addr: Option<String>,
    pub api_token: Option<String>,
    pub migrate_on_startup: bool,
    pub max_payload_bytes: usize,
    pub document: QueueSettings,
    pub webhook: QueueSettings,
    pub shutdown_grace: Duration,
    pub retention_interval: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(get);

        let database_url = env
            .get("DATABASE_URL")
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let pool = PoolSettings::from_lookup(|k| env.get(k));

        let worker_id = env
            .or_fallback("CASEQUEUE_WORKER_ID", "WORKER_ID")
            .or_else(|| env.get("HOSTNAME"))
            .unwrap_or_else(|| "worker-1".to_string());

        let admin_addr = env
            .or_fallback("CASEQUEUE_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let api_token = env
            .or_fallback("CASEQUEUE_API_TOKEN", "ADMIN_API_TOKEN")
            .map(|s| s.trim().to_string());

        let migrate_on_startup = env.bool("CASEQUEUE_MIGRATE_ON_STARTUP").unwrap_or(false);

        let max_payload_bytes = env
            .parsed("CASEQUEUE_MAX_PAYLOAD_BYTES", "MAX_PAYLOAD_BYTES")
            .unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES);

        let d = QueueSettings::document_defaults();
        let document = QueueSettings {
            max_concurrent: env
                .parsed("CASEQUEUE_DOC_MAX_CONCURRENT", "DOC_QUEUE_MAX_CONCURRENT")
                .unwrap_or(d.max_concurrent)
                .max(1),
            poll_interval: env
                .millis("CASEQUEUE_DOC_POLL_INTERVAL_MS", "DOC_QUEUE_POLL_INTERVAL_MS")
                .unwrap_or(d.poll_interval),
            max_attempts: env
                .parsed("CASEQUEUE_DOC_MAX_RETRIES", "DOC_QUEUE_MAX_RETRIES")
                .unwrap_or(d.max_attempts),
            base_retry_delay: env
                .millis("CASEQUEUE_DOC_BASE_RETRY_DELAY_MS", "DOC_QUEUE_BASE_RETRY_DELAY_MS")
                .unwrap_or(d.base_retry_delay),
            max_retry_delay: env
                .millis("CASEQUEUE_DOC_MAX_RETRY_DELAY_MS", "DOC_QUEUE_MAX_RETRY_DELAY_MS")
                .unwrap_or(d.max_retry_delay),
            job_timeout: env
                .millis("CASEQUEUE_DOC_JOB_TIMEOUT_MS", "DOC_QUEUE_JOB_TIMEOUT_MS")
                .unwrap_or(d.job_timeout),
        };

        let w = QueueSettings::webhook_defaults();
        let webhook = QueueSettings {
            max_concurrent: env
                .parsed("CASEQUEUE_WEBHOOK_MAX_CONCURRENT", "WEBHOOK_WORKER_MAX_CONCURRENT")
                .unwrap_or(w.max_concurrent)
                .max(1),
            poll_interval: env
                .millis("CASEQUEUE_WEBHOOK_POLL_INTERVAL_MS", "WEBHOOK_WORKER_POLL_INTERVAL")
                .unwrap_or(w.poll_interval),
            max_attempts: env
                .parsed("CASEQUEUE_WEBHOOK_MAX_RETRIES", "WEBHOOK_MAX_RETRIES")
                .unwrap_or(w.max_attempts),
            base_retry_delay: env
                .millis("CASEQUEUE_WEBHOOK_RETRY_DELAY_MS", "WEBHOOK_RETRY_DELAY_MS")
                .unwrap_or(w.base_retry_delay),
            max_retry_delay: env
                .millis("CASEQUEUE_WEBHOOK_MAX_RETRY_DELAY_MS", "WEBHOOK_MAX_RETRY_DELAY_MS")
                .unwrap_or(w.max_retry_delay),
            job_timeout: env
                .millis("CASEQUEUE_WEBHOOK_JOB_TIMEOUT_MS", "WEBHOOK_JOB_TIMEOUT_MS")
                .unwrap_or(w.job_timeout),
        };

        let shutdown_grace = env
            .millis("CASEQUEUE_SHUTDOWN_GRACE_MS", "SHUTDOWN_GRACE_MS")
            .unwrap_or(Duration::from_secs(30));

        let retention_interval = env
            .parsed::<u64>("CASEQUEUE_RETENTION_INTERVAL_SECS", "MAINTENANCE_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        Ok(Self {
            database_url,
            pool,
            worker_id,
            admin_addr,
            api_token,
            migrate_on_startup,
            max_payload_bytes,
            document,
            webhook,
            shutdown_grace,
            retention_interval,
        })
    }

    pub fn queue(&self, category: JobCategory) -> &QueueSettings {
        match category {
            JobCategory::DocumentProcessing => &self.document,
            JobCategory::WebhookDelivery => &self.webhook,
        }
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|s| !s.trim().is_empty())
    }

    fn or_fallback(&self, primary: &str, fallback: &str) -> Option<String> {
        self.get(primary).or_else(|| self.get(fallback))
    }

    fn parsed<T: std::str::FromStr>(&self, primary: &str, fallback: &str) -> Option<T> {
        self.or_fallback(primary, fallback)
            .and_then(|s| s.trim().parse().ok())
    }

    fn millis(&self, primary: &str, fallback: &str) -> Option<Duration> {
        self.parsed::<u64>(primary, fallback).map(Duration::from_millis)
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |k| map.get(k).cloned())
    }

    #[test]
    fn database_url_is_required() {
        assert!(config(&[]).is_err());
    }

    #[test]
    fn defaults_match_queue_profiles() {
        let cfg = config(&[("DATABASE_URL", "postgres://x")]).unwrap();
        assert_eq!(cfg.document, QueueSettings::document_defaults());
        assert_eq!(cfg.webhook, QueueSettings::webhook_defaults());
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(30));
        assert_eq!(cfg.max_payload_bytes, 256 * 1024);
        assert!(cfg.admin_addr.is_none());
        assert!(cfg.api_token.is_none());
    }

    #[test]
    fn legacy_names_are_fallbacks() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://x"),
            ("DOC_QUEUE_MAX_CONCURRENT", "5"),
            ("CASEQUEUE_DOC_POLL_INTERVAL_MS", "100"),
            ("DOC_QUEUE_POLL_INTERVAL_MS", "9999"),
            ("WEBHOOK_MAX_RETRIES", "7"),
            ("ADMIN_ADDR", "off"),
        ])
        .unwrap();
        assert_eq!(cfg.document.max_concurrent, 5);
        assert_eq!(cfg.document.poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.webhook.max_attempts, 7);
        assert!(cfg.admin_addr.is_none());
    }

    #[test]
    fn handler_timeout_stays_below_job_timeout() {
        let d = QueueSettings::document_defaults();
        assert_eq!(d.handler_timeout(), Duration::from_secs(9 * 60));

        let mut short = QueueSettings::webhook_defaults();
        short.job_timeout = Duration::from_millis(50);
        assert_eq!(short.handler_timeout(), Duration::from_millis(45));

        for ms in [1, 10, 999, 30_000, 3_600_000] {
            short.job_timeout = Duration::from_millis(ms);
            assert!(short.handler_timeout() < short.job_timeout, "job_timeout={ms}ms");
        }
    }

    #[test]
    fn pool_settings_read_from_same_lookup() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://x"),
            ("CASEQUEUE_DB_MAX_CONNECTIONS", "3"),
        ])
        .unwrap();
        assert_eq!(cfg.pool.max_connections, 3);
        assert!(cfg.pool.disable_jit);
    }

    #[test]
    fn retry_policy_uses_queue_delays() {
        let p = QueueSettings::webhook_defaults().retry_policy();
        assert_eq!(p.delay_for(1), chrono::Duration::seconds(1));
        assert_eq!(p.delay_for(10), chrono::Duration::seconds(30));
    }
}
