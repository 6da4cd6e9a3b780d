//! HTTP dispatch layer
//!
//! Thin JSON front end over the store: routing, request decoding, TTL
//! parsing, and the optional shared-password check. All cache semantics live
//! in [`Store`]; this layer only maps results onto status codes.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::error::{CacheError, Result};
use crate::stats::StatsSnapshot;
use crate::store::Store;
use crate::value::IndexValue;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
}

impl AppState {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetRequest {
    pub value: JsonValue,
    /// Human-readable duration, e.g. `"50ms"`, `"10s"`, `"1h"`.
    pub ttl: String,
    #[serde(default)]
    pub indexes: HashMap<String, JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct SetResponse {
    pub status: &'static str,
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct GetResponse {
    pub key: String,
    pub value: JsonValue,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub status: &'static str,
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryParams {
    pub index: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/set/:key", post(set_handler))
        .route("/get/:key", get(get_handler))
        .route("/delete/:key", delete(delete_handler))
        .route("/query", get(query_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Checks `Authorization: Bearer <password>` when the store carries a shared
/// secret. The core never checks it; enforcement lives here.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let Some(expected) = state.store.password() else {
        return Ok(());
    };

    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if provided == Some(expected) {
        Ok(())
    } else {
        Err(CacheError::Unauthorized)
    }
}

async fn set_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SetRequest>,
) -> Result<(StatusCode, Json<SetResponse>)> {
    authorize(&state, &headers)?;

    let ttl = humantime::parse_duration(&req.ttl)
        .map_err(|e| CacheError::InvalidInput(format!("invalid TTL {:?}: {}", req.ttl, e)))?;
    if ttl.is_zero() {
        return Err(CacheError::InvalidInput(format!(
            "TTL must be positive, got {:?}",
            req.ttl
        )));
    }

    state.store.set(&key, req.value, ttl, &req.indexes)?;

    Ok((
        StatusCode::CREATED,
        Json(SetResponse {
            status: "ok",
            key,
        }),
    ))
}

async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Json<GetResponse>> {
    authorize(&state, &headers)?;

    match state.store.get(&key) {
        Some(value) => Ok(Json(GetResponse { key, value })),
        None => Err(CacheError::NotFound(key)),
    }
}

async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>> {
    authorize(&state, &headers)?;

    state.store.delete(&key)?;
    Ok(Json(DeleteResponse {
        status: "ok",
        key,
    }))
}

async fn query_handler(
    State(state): State<AppState>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
) -> Result<Json<QueryResponse>> {
    authorize(&state, &headers)?;

    let value = parse_query_value(&params.value);
    let keys = state.store.query(&params.index, &value);
    if keys.is_empty() {
        return Err(CacheError::NotFound(format!(
            "no results for index {:?}",
            params.index
        )));
    }

    Ok(Json(QueryResponse { keys }))
}

async fn stats_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatsSnapshot>> {
    authorize(&state, &headers)?;
    Ok(Json(state.store.stats()))
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Interprets the `value` query parameter: JSON numbers and quoted strings
/// keep their type (`value=1` is the integer, `value="1"` the string);
/// anything else is taken as a bare string.
fn parse_query_value(raw: &str) -> IndexValue {
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(JsonValue::Number(n)) => {
            IndexValue::from_json(&JsonValue::Number(n)).unwrap_or_else(|_| {
                IndexValue::Str(raw.to_string())
            })
        }
        Ok(JsonValue::String(s)) => IndexValue::Str(s),
        _ => IndexValue::Str(raw.to_string()),
    }
}
