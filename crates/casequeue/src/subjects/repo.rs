use crate::error::{QueueError, Result};
use crate::subjects::{EntityStore, Versioned};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

/// Subject documents stored as JSONB with a version column.
#[derive(Clone)]
pub struct PgSubjectStore {
    pool: PgPool,
}

impl PgSubjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStore for PgSubjectStore {
    type Entity = Value;

    async fn load(&self, key: &str) -> Result<Option<Versioned<Value>>> {
        let row: Option<(Value, i64)> =
            sqlx::query_as("SELECT doc, version FROM subjects WHERE id = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value, version)| Versioned { value, version }))
    }

    async fn save(&self, key: &str, entity: &Value, expected_version: i64) -> Result<i64> {
        let saved: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE subjects
            SET doc = $2,
                version = version + 1,
                updated_at = now()
            WHERE id = $1
              AND version = $3
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(entity)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version) = saved {
            return Ok(version);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT version FROM subjects WHERE id = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Err(match exists {
            Some(_) => QueueError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
            },
            None => QueueError::EntityNotFound(key.to_string()),
        })
    }

    async fn put(&self, key: &str, entity: &Value) -> Result<i64> {
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO subjects (id, doc, version, updated_at)
            VALUES ($1, $2, 1, now())
            ON CONFLICT (id) DO UPDATE
              SET doc = EXCLUDED.doc,
                  version = subjects.version + 1,
                  updated_at = now()
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(entity)
        .fetch_one(&self.pool)
        .await?;
        Ok(version)
    }
}
