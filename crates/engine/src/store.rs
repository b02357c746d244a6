//! Storage collaborators of the promotion loop
//!
//! The loop only sees three narrow traits. `SqliteStores` backs them with the
//! persistence crate; `InMemoryStores` backs them with process memory for dry
//! runs and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use persistence::repository::{
    ConfigRepository, EvolutionLogRepository, ModelVersionRecord, ModelVersionRepository,
};
use persistence::{DbError, SqlitePool};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{ModelVersion, StrategyParameters};

/// Key of the current strategy configuration in the key-value table
pub const STRATEGY_CONFIG_KEY: &str = "strategy_config";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("corrupt {what}: {source}")]
    Corrupt {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("version {0} already exists")]
    DuplicateVersion(String),

    #[error("store unavailable")]
    Unavailable,
}

/// Current strategy configuration
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Creates and persists the default configuration when none exists
    async fn get(&self) -> Result<StrategyParameters, StoreError>;
    async fn put(&self, params: &StrategyParameters) -> Result<(), StoreError>;
}

/// Append-only model version history
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Most recent promoted version
    async fn get_best(&self) -> Result<Option<ModelVersion>, StoreError>;
    async fn append(&self, version: &str, metrics: &Value, promoted: bool) -> Result<ModelVersion, StoreError>;
}

/// Audit trail of generations and decisions
#[async_trait]
pub trait EvolutionJournal: Send + Sync {
    async fn record(&self, message: &str, data: &Value, params_hash: Option<&str>) -> Result<(), StoreError>;
}

fn to_model_version(record: ModelVersionRecord) -> Result<ModelVersion, StoreError> {
    let metrics = serde_json::from_str(&record.metrics).map_err(|source| StoreError::Corrupt {
        what: "model metrics",
        source,
    })?;
    Ok(ModelVersion {
        id: record.id,
        version: record.version,
        metrics,
        promoted: record.promoted,
        created_at: DateTime::from_timestamp(record.created_at, 0).unwrap_or_default(),
    })
}

/// SQLite-backed stores
#[derive(Clone)]
pub struct SqliteStores {
    pool: SqlitePool,
}

impl SqliteStores {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Recent versions, newest first
    pub async fn list_versions(&self, limit: i64) -> Result<Vec<ModelVersion>, StoreError> {
        ModelVersionRepository::new(&self.pool)
            .list_recent(limit)
            .await?
            .into_iter()
            .map(to_model_version)
            .collect()
    }

    pub async fn get_version(&self, version: &str) -> Result<Option<ModelVersion>, StoreError> {
        ModelVersionRepository::new(&self.pool)
            .get_by_version(version)
            .await?
            .map(to_model_version)
            .transpose()
    }
}

#[async_trait]
impl ConfigStore for SqliteStores {
    async fn get(&self) -> Result<StrategyParameters, StoreError> {
        let default = serde_json::to_value(StrategyParameters::default()).map_err(DbError::from)?;
        let value = ConfigRepository::new(&self.pool)
            .get_or_insert(STRATEGY_CONFIG_KEY, &default)
            .await?;
        serde_json::from_value(value).map_err(|source| StoreError::Corrupt {
            what: "strategy configuration",
            source,
        })
    }

    async fn put(&self, params: &StrategyParameters) -> Result<(), StoreError> {
        let value = serde_json::to_value(params).map_err(DbError::from)?;
        ConfigRepository::new(&self.pool)
            .put(STRATEGY_CONFIG_KEY, &value)
            .await?;
        info!(?params, "Strategy configuration saved");
        Ok(())
    }
}

#[async_trait]
impl ModelStore for SqliteStores {
    async fn get_best(&self) -> Result<Option<ModelVersion>, StoreError> {
        ModelVersionRepository::new(&self.pool)
            .get_best()
            .await?
            .map(to_model_version)
            .transpose()
    }

    async fn append(&self, version: &str, metrics: &Value, promoted: bool) -> Result<ModelVersion, StoreError> {
        let record = ModelVersionRepository::new(&self.pool)
            .append(version, metrics, promoted)
            .await?;
        debug!(version, promoted, id = record.id, "Model version appended");
        to_model_version(record)
    }
}

#[async_trait]
impl EvolutionJournal for SqliteStores {
    async fn record(&self, message: &str, data: &Value, params_hash: Option<&str>) -> Result<(), StoreError> {
        EvolutionLogRepository::new(&self.pool)
            .append(message, Some(data), params_hash)
            .await?;
        Ok(())
    }
}

/// An entry of the in-memory journal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    pub message: String,
    pub data: Value,
    pub params_hash: Option<String>,
}

/// Process-memory stores. Can be switched to fail every call.
#[derive(Default)]
pub struct InMemoryStores {
    config: Mutex<Option<StrategyParameters>>,
    versions: Mutex<Vec<ModelVersion>>,
    journal: Mutex<Vec<JournalEntry>>,
    unavailable: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(params: StrategyParameters) -> Self {
        let stores = Self::default();
        *lock(&stores.config) = Some(params);
        stores
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn versions(&self) -> Vec<ModelVersion> {
        lock(&self.versions).clone()
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.journal).clone()
    }

    pub fn current_config(&self) -> Option<StrategyParameters> {
        lock(&self.config).clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConfigStore for InMemoryStores {
    async fn get(&self) -> Result<StrategyParameters, StoreError> {
        self.check()?;
        Ok(lock(&self.config).get_or_insert_with(StrategyParameters::default).clone())
    }

    async fn put(&self, params: &StrategyParameters) -> Result<(), StoreError> {
        self.check()?;
        *lock(&self.config) = Some(params.clone());
        Ok(())
    }
}

#[async_trait]
impl ModelStore for InMemoryStores {
    async fn get_best(&self) -> Result<Option<ModelVersion>, StoreError> {
        self.check()?;
        Ok(lock(&self.versions).iter().rev().find(|v| v.promoted).cloned())
    }

    async fn append(&self, version: &str, metrics: &Value, promoted: bool) -> Result<ModelVersion, StoreError> {
        self.check()?;
        let mut versions = lock(&self.versions);
        if versions.iter().any(|v| v.version == version) {
            return Err(StoreError::DuplicateVersion(version.to_string()));
        }
        let record = ModelVersion {
            id: versions.len() as i64 + 1,
            version: version.to_string(),
            metrics: metrics.clone(),
            promoted,
            created_at: Utc::now(),
        };
        versions.push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl EvolutionJournal for InMemoryStores {
    async fn record(&self, message: &str, data: &Value, params_hash: Option<&str>) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.journal).push(JournalEntry {
            message: message.to_string(),
            data: data.clone(),
            params_hash: params_hash.map(str::to_string),
        });
        Ok(())
    }
}
