//! Admin surface: key CRUD, probes, stats, and pool settings. Thin glue over
//! the pool; guarded by the admin bearer token when one is configured.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::AppError;
use crate::models::key::{ApiKey, KeyStatus};
use crate::proxy::pool::StrategyKind;
use crate::proxy::state::AppState;
use crate::proxy::upstream::KeyProbeResult;

pub const SETTING_STRATEGY: &str = "pool.strategy";
pub const SETTING_COOLDOWN: &str = "pool.cooldown_seconds";
pub const SETTING_MAX_FAILURES: &str = "pool.max_consecutive_failures";

fn success(data: impl Serialize) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

/// GET /api/keys.
pub async fn list_keys(State(state): State<AppState>) -> Response {
    let keys = state.pool.snapshot();
    let total = keys.len();
    Json(json!({ "success": true, "data": keys, "total": total })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// POST /api/keys.
pub async fn create_key(
    State(state): State<AppState>,
    Json(body): Json<CreateKeyRequest>,
) -> Result<Response, AppError> {
    if body.key.trim().is_empty() {
        return Err(AppError::invalid_request("Key cannot be empty").with_param("key"));
    }

    let key = ApiKey::from_config(&crate::models::config::KeyConfig {
        key: body.key.trim().to_string(),
        name: body.name,
        enabled: true,
        tags: body.tags,
    });
    let created = state.pool.add_key(key)?;
    info!("added key {} ({})", created.masked_key, created.id);

    let mut projection = created;
    projection.api_key.clear();
    Ok((StatusCode::CREATED, success(projection)).into_response())
}

/// DELETE /api/keys/:id.
pub async fn delete_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    state.pool.remove_key(&id)?;
    info!("removed key {id}");
    Ok(Json(json!({ "success": true, "message": "Key deleted" })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ImportKeysRequest {
    pub keys: Vec<CreateKeyRequest>,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportKeysResult {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// POST /api/keys/import.
pub async fn import_keys(
    State(state): State<AppState>,
    Json(body): Json<ImportKeysRequest>,
) -> Response {
    let mut result = ImportKeysResult::default();
    for item in body.keys {
        let secret = item.key.trim();
        if secret.is_empty() {
            result.errors.push("empty key skipped".to_string());
            continue;
        }
        let key = ApiKey::from_config(&crate::models::config::KeyConfig {
            key: secret.to_string(),
            name: item.name,
            enabled: true,
            tags: item.tags,
        });
        match state.pool.add_key(key) {
            Ok(_) => result.imported += 1,
            Err(err) if err.message.contains("already exists") => result.skipped += 1,
            Err(err) => result.errors.push(err.message),
        }
    }
    success(result)
}

/// POST /api/keys/:id/test — probes the stored key against the live models
/// endpoint and reports measured latency.
pub async fn test_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let key = state
        .pool
        .get_key_by_id(&id)
        .ok_or_else(|| AppError::not_found("Key"))?;
    let result = state.client.probe_key(&key.api_key).await;
    if !result.valid {
        warn!("key {} failed probe: {:?}", key.masked_key, result.error);
    }
    Ok(success(result))
}

#[derive(Debug, Deserialize)]
pub struct ValidateKeyRequest {
    pub key: String,
}

/// POST /api/keys/validate — probes a raw candidate key before it is added.
pub async fn validate_key(
    State(state): State<AppState>,
    Json(body): Json<ValidateKeyRequest>,
) -> Result<Json<KeyProbeResult>, AppError> {
    if body.key.trim().is_empty() {
        return Err(AppError::invalid_request("Key cannot be empty").with_param("key"));
    }
    Ok(Json(state.client.probe_key(body.key.trim()).await))
}

#[derive(Debug, Serialize)]
struct KeyStatItem {
    key_id: String,
    key_name: String,
    request_count: u64,
    success_rate: f64,
    token_usage: u64,
}

/// GET /api/stats — aggregate and per-key statistics from the pool snapshot.
pub async fn stats(State(state): State<AppState>) -> Response {
    let snapshot = state.pool.snapshot();

    let mut totals = (0u64, 0u64, 0u64, 0u64, 0u64);
    let mut rate_limited = 0usize;
    let per_key: Vec<KeyStatItem> = snapshot
        .iter()
        .map(|key| {
            totals.0 += key.stats.request_count;
            totals.1 += key.stats.success_count;
            totals.2 += key.stats.error_count;
            totals.3 += key.stats.prompt_tokens;
            totals.4 += key.stats.completion_tokens;
            if key.status == KeyStatus::RateLimited {
                rate_limited += 1;
            }
            KeyStatItem {
                key_id: key.id.clone(),
                key_name: key.name.clone(),
                request_count: key.stats.request_count,
                success_rate: key.stats.success_rate() * 100.0,
                token_usage: key.stats.total_tokens(),
            }
        })
        .collect();

    success(json!({
        "requests": {
            "total": totals.0,
            "success": totals.1,
            "error": totals.2,
            "rate_limited_keys": rate_limited,
        },
        "tokens": {
            "prompt": totals.3,
            "completion": totals.4,
            "total": totals.3 + totals.4,
        },
        "keys": per_key,
    }))
}

#[derive(Debug, Serialize)]
pub struct PoolSettings {
    pub strategy: &'static str,
    pub cooldown_seconds: u64,
    pub max_consecutive_failures: u32,
}

/// GET /api/pool/settings.
pub async fn get_pool_settings(State(state): State<AppState>) -> Response {
    success(PoolSettings {
        strategy: state.pool.strategy_name(),
        cooldown_seconds: state.pool.cooldown_seconds(),
        max_consecutive_failures: state.pool.max_consecutive_failures(),
    })
}

#[derive(Debug, Deserialize)]
pub struct UpdatePoolSettings {
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
}

/// PUT /api/pool/settings — applied hot, persisted to the settings table.
pub async fn update_pool_settings(
    State(state): State<AppState>,
    Json(body): Json<UpdatePoolSettings>,
) -> Result<Response, AppError> {
    if let Some(name) = &body.strategy {
        let kind = StrategyKind::parse(name)
            .ok_or_else(|| AppError::invalid_request(format!("Unknown strategy: {name}")))?;
        state.pool.set_strategy(kind);
        persist_setting(&state, SETTING_STRATEGY, kind.as_str());
    }
    if let Some(seconds) = body.cooldown_seconds {
        if seconds == 0 {
            return Err(AppError::invalid_request("cooldown_seconds must be positive"));
        }
        state.pool.set_cooldown_seconds(seconds);
        persist_setting(&state, SETTING_COOLDOWN, &seconds.to_string());
    }
    if let Some(count) = body.max_consecutive_failures {
        if count == 0 {
            return Err(AppError::invalid_request(
                "max_consecutive_failures must be positive",
            ));
        }
        state.pool.set_max_consecutive_failures(count);
        persist_setting(&state, SETTING_MAX_FAILURES, &count.to_string());
    }

    Ok(success(PoolSettings {
        strategy: state.pool.strategy_name(),
        cooldown_seconds: state.pool.cooldown_seconds(),
        max_consecutive_failures: state.pool.max_consecutive_failures(),
    }))
}

fn persist_setting(state: &AppState, key: &str, value: &str) {
    if let Some(store) = &state.store {
        if let Err(err) = store.set_setting(key, value) {
            warn!("failed to persist setting {key}: {err}");
        }
    }
}
