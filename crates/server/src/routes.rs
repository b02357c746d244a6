//! HTTP serving surface

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use engine::{ConfigStore, ModelStore, Notifier, SqliteStores, StrategyParameters};
use persistence::repository::EvolutionLogRepository;
use persistence::Database;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

/// Version the serving layer currently advertises
pub struct ServingState {
    version: RwLock<String>,
}

impl ServingState {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            version: RwLock::new(initial.into()),
        }
    }

    pub fn current(&self) -> String {
        self.version
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set(&self, version: impl Into<String>) {
        *self
            .version
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = version.into();
    }
}

impl Default for ServingState {
    fn default() -> Self {
        Self::new("none")
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub stores: SqliteStores,
    pub serving: Arc<ServingState>,
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    pub fn new(db: Database, notifier: Arc<dyn Notifier>) -> Self {
        let stores = SqliteStores::new(db.pool_clone());
        Self {
            db: Arc::new(db),
            stores,
            serving: Arc::new(ServingState::default()),
            notifier,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api_root))
        .route("/health", get(api_health))
        .route("/metrics", get(api_metrics))
        .route("/reload", post(api_reload))
        .route("/config", post(api_update_config))
        .route("/best_model", get(api_best_model))
        .route("/versions", get(api_versions))
        .route("/evolution", get(api_evolution))
        .with_state(state)
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn internal(context: &str, e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    warn!(error = %e, "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{context}: {e}") })),
    )
}

fn limit_param(params: &HashMap<String, String>) -> i64 {
    params
        .get("limit")
        .and_then(|s| s.parse().ok())
        .unwrap_or(20)
        .clamp(1, 500)
}

/// GET /: liveness plus what is being served
async fn api_root(State(state): State<AppState>) -> ApiResult {
    let config = ConfigStore::get(&state.stores)
        .await
        .map_err(|e| internal("Failed to load configuration", e))?;
    let best = state
        .stores
        .get_best()
        .await
        .map_err(|e| internal("Failed to load best model", e))?;

    Ok(Json(json!({
        "message": "Bot is alive!",
        "serving_version": state.serving.current(),
        "best_version": best.map(|b| b.version),
        "config": config,
    })))
}

/// GET /health
async fn api_health(State(state): State<AppState>) -> Json<Value> {
    match state.stores.get_best().await {
        Ok(best) => Json(json!({
            "status": "ok",
            "best_model": best.map(|b| b.version),
        })),
        Err(e) => Json(json!({
            "status": "degraded",
            "error": e.to_string(),
        })),
    }
}

/// GET /metrics: metrics document of the best model
async fn api_metrics(State(state): State<AppState>) -> ApiResult {
    let best = state
        .stores
        .get_best()
        .await
        .map_err(|e| internal("Failed to load best model", e))?;
    Ok(Json(match best {
        Some(model) => model.metrics,
        None => json!({ "note": "no model yet" }),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReloadQuery {
    pub version: String,
}

/// POST /reload?version=: adopt a newly promoted version
async fn api_reload(State(state): State<AppState>, Query(query): Query<ReloadQuery>) -> Json<Value> {
    state.serving.set(query.version.clone());
    info!(version = %query.version, "Serving version reloaded");
    state
        .notifier
        .send(&format!("Reloaded to {}", query.version), &json!({}))
        .await;

    Json(json!({
        "status": "ok",
        "serving_version": state.serving.current(),
    }))
}

/// POST /config: validate and persist a strategy configuration
async fn api_update_config(
    State(state): State<AppState>,
    Json(params): Json<StrategyParameters>,
) -> ApiResult {
    let errors = params.validation_errors();
    if !errors.is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "status": "invalid", "errors": errors })),
        ));
    }

    state
        .stores
        .put(&params)
        .await
        .map_err(|e| internal("Failed to save configuration", e))?;

    Ok(Json(json!({ "status": "ok", "config": params })))
}

/// GET /best_model
async fn api_best_model(State(state): State<AppState>) -> ApiResult {
    let best = state
        .stores
        .get_best()
        .await
        .map_err(|e| internal("Failed to load best model", e))?;
    Ok(Json(match best {
        Some(model) => json!({ "version": model.version, "metrics": model.metrics }),
        None => json!({}),
    }))
}

/// GET /versions?limit=: recent model versions, newest first
async fn api_versions(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let limit = limit_param(&params);
    let versions = state
        .stores
        .list_versions(limit)
        .await
        .map_err(|e| internal("Failed to list versions", e))?;
    Ok(Json(json!({ "data": versions, "limit": limit })))
}

/// GET /evolution?limit=: recent evolution journal entries
async fn api_evolution(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult {
    let limit = limit_param(&params);
    let records = EvolutionLogRepository::new(state.db.pool())
        .recent(limit)
        .await
        .map_err(|e| internal("Failed to read evolution log", e))?;

    let entries: Vec<Value> = records
        .into_iter()
        .map(|r| {
            let data = r
                .data
                .as_deref()
                .and_then(|d| serde_json::from_str::<Value>(d).ok())
                .unwrap_or(Value::Null);
            json!({
                "id": r.id,
                "message": r.message,
                "data": data,
                "params_hash": r.params_hash,
                "created_at": r.created_at,
            })
        })
        .collect();

    Ok(Json(json!({ "data": entries, "limit": limit })))
}
