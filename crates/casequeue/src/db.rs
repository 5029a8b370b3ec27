use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Connection pool tuning, shared by the worker binary and `casequeuectl`.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Server-side cap per statement; `None` keeps the database default.
    pub statement_timeout: Option<Duration>,
    pub application_name: String,
    /// JIT compilation only slows down the short claim and update queries.
    pub disable_jit: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout: Duration::from_secs(10),
            statement_timeout: None,
            application_name: "casequeue".to_string(),
            disable_jit: true,
        }
    }
}

impl PoolSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Unparseable values fall back to the defaults; sizes are clamped to a
    /// range the claim loop can live with.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let var = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let max_connections = var("CASEQUEUE_DB_MAX_CONNECTIONS")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(d.max_connections)
            .clamp(1, 64);

        let acquire_timeout = var("CASEQUEUE_DB_ACQUIRE_TIMEOUT_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|s| Duration::from_secs(s.clamp(1, 60)))
            .unwrap_or(d.acquire_timeout);

        let statement_timeout = var("CASEQUEUE_DB_STATEMENT_TIMEOUT_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let application_name = var("CASEQUEUE_DB_APPLICATION_NAME").unwrap_or(d.application_name);

        let disable_jit = var("CASEQUEUE_DISABLE_JIT")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(d.disable_jit);

        Self {
            max_connections,
            acquire_timeout,
            statement_timeout,
            application_name,
            disable_jit,
        }
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Session statements run on every new connection.
    fn session_statements(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.disable_jit {
            out.push("SET jit = OFF".to_string());
        }
        if let Some(t) = self.statement_timeout {
            out.push(format!("SET statement_timeout = {}", t.as_millis()));
        }
        out
    }
}

pub async fn make_pool(database_url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let connect = PgConnectOptions::from_str(database_url)?.application_name(&settings.application_name);
    let statements = settings.session_statements();

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .after_connect(move |conn, _meta| {
            let statements = statements.clone();
            Box::pin(async move {
                for sql in &statements {
                    sqlx::query(sql).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect_with(connect)
        .await?;

    info!(
        max_connections = settings.max_connections,
        acquire_timeout_ms = settings.acquire_timeout.as_millis() as u64,
        statement_timeout_ms = settings.statement_timeout.map(|t| t.as_millis() as u64),
        application_name = %settings.application_name,
        jit = !settings.disable_jit,
        "database pool ready"
    );

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("migrations applied");
    Ok(())
}
