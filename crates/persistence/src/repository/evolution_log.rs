//! Evolution log repository: journal of generation winners and cycle decisions

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EvolutionLogRecord {
    pub id: i64,
    pub message: String,
    pub data: Option<String>,
    pub params_hash: Option<String>,
    pub created_at: i64,
}

pub struct EvolutionLogRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> EvolutionLogRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        message: &str,
        data: Option<&serde_json::Value>,
        params_hash: Option<&str>,
    ) -> DbResult<i64> {
        let json = data.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            "INSERT INTO evolution_log (message, data, params_hash) VALUES (?1, ?2, ?3)",
        )
        .bind(message)
        .bind(json)
        .bind(params_hash)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Newest first
    pub async fn recent(&self, limit: i64) -> DbResult<Vec<EvolutionLogRecord>> {
        let records = sqlx::query_as::<_, EvolutionLogRecord>(
            r#"SELECT id, message, data, params_hash, COALESCE(created_at, 0) AS created_at
               FROM evolution_log ORDER BY id DESC LIMIT ?1"#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}
