//! Config repository: key/value store for the current strategy configuration

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A single configuration entry; `value` is a JSON document
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConfigRecord {
    pub id: i64,
    pub key: String,
    pub value: String,
}

/// Repository for the `config_kv` table
pub struct ConfigRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ConfigRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch the entry stored under `key`
    pub async fn get(&self, key: &str) -> DbResult<Option<ConfigRecord>> {
        let record = sqlx::query_as::<_, ConfigRecord>(
            "SELECT id, key, value FROM config_kv WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Insert or replace the JSON value stored under `key`
    pub async fn put(&self, key: &str, value: &serde_json::Value) -> DbResult<()> {
        let json = serde_json::to_string(value)?;
        sqlx::query(
            r#"INSERT INTO config_kv (key, value) VALUES (?1, ?2)
               ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
        )
        .bind(key)
        .bind(json)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Insert `value` only when `key` is absent; returns the stored value either way
    pub async fn get_or_insert(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> DbResult<serde_json::Value> {
        let json = serde_json::to_string(value)?;
        sqlx::query("INSERT OR IGNORE INTO config_kv (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(json)
            .execute(self.pool)
            .await?;

        match self.get(key).await? {
            Some(record) => Ok(serde_json::from_str(&record.value)?),
            None => Err(crate::DbError::Query(format!("config key {key} vanished after insert"))),
        }
    }
}
