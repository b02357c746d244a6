//! Model version repository: append-only champion history

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted model version; `metrics` is a JSON document
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModelVersionRecord {
    pub id: i64,
    pub version: String,
    pub metrics: String,
    pub promoted: bool,
    pub created_at: i64,
}

/// Repository for the `model_versions` table.
/// Rows are never updated: a new champion is always a new row.
pub struct ModelVersionRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ModelVersionRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a version and return the stored row
    pub async fn append(
        &self,
        version: &str,
        metrics: &serde_json::Value,
        promoted: bool,
    ) -> DbResult<ModelVersionRecord> {
        let json = serde_json::to_string(metrics)?;
        let result = sqlx::query(
            r#"INSERT INTO model_versions (version, metrics, promoted)
               VALUES (?1, ?2, ?3)"#,
        )
        .bind(version)
        .bind(json)
        .bind(promoted)
        .execute(self.pool)
        .await?;

        let record = sqlx::query_as::<_, ModelVersionRecord>(
            r#"SELECT id, version, metrics, promoted, COALESCE(created_at, 0) AS created_at
               FROM model_versions WHERE id = ?1"#,
        )
        .bind(result.last_insert_rowid())
        .fetch_one(self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent promoted version (highest id)
    pub async fn get_best(&self) -> DbResult<Option<ModelVersionRecord>> {
        let record = sqlx::query_as::<_, ModelVersionRecord>(
            r#"SELECT id, version, metrics, promoted, COALESCE(created_at, 0) AS created_at
               FROM model_versions WHERE promoted = 1
               ORDER BY id DESC LIMIT 1"#,
        )
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Look up a version by its label
    pub async fn get_by_version(&self, version: &str) -> DbResult<Option<ModelVersionRecord>> {
        let record = sqlx::query_as::<_, ModelVersionRecord>(
            r#"SELECT id, version, metrics, promoted, COALESCE(created_at, 0) AS created_at
               FROM model_versions WHERE version = ?1"#,
        )
        .bind(version)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Newest first, promoted or not
    pub async fn list_recent(&self, limit: i64) -> DbResult<Vec<ModelVersionRecord>> {
        let records = sqlx::query_as::<_, ModelVersionRecord>(
            r#"SELECT id, version, metrics, promoted, COALESCE(created_at, 0) AS created_at
               FROM model_versions ORDER BY id DESC LIMIT ?1"#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}
