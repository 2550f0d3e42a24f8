//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::storage;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    tracing::error!(error = %e, "api query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    50
}

async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let pool = state.pool.clone();
    let limit = params.limit.min(1000);
    let runs = tokio::task::spawn_blocking(move || storage::list_runs(&pool, limit))
        .await
        .map_err(|e| internal_error(e.into()))?
        .map_err(internal_error)?;
    Ok(Json(json!({
        "data": runs,
        "meta": { "total": runs.len(), "limit": limit }
    })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let pool = state.pool.clone();
    let lookup = id.clone();
    let run = tokio::task::spawn_blocking(move || storage::get_run(&pool, &lookup))
        .await
        .map_err(|e| internal_error(e.into()))?
        .map_err(internal_error)?;
    match run {
        Some(run) => Ok(Json(json!({ "data": run, "meta": meta() }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("run {} not found", id) })),
        )),
    }
}
