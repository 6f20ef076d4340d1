//! Health, metrics and model lifecycle control.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use tracing::info;

use super::{ApiError, AppState};
use crate::context::RunContext;
use crate::metrics;
use crate::registry::LifecycleStatus;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub models_ready: usize,
}

#[derive(Debug, Serialize)]
pub struct PreloadResponse {
    pub id: String,
    pub status: LifecycleStatus,
}

#[derive(Debug, Serialize)]
pub struct EvictResponse {
    pub id: String,
    pub evicted: bool,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let models_ready = state
        .orchestrator
        .registry()
        .snapshot()
        .iter()
        .filter(|m| m.status == LifecycleStatus::Ready)
        .count();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        models_ready,
    })
}

pub async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let body = metrics::gather().map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// `POST /admin/models/{id}/preload`
pub async fn preload_model(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = path
        .strip_suffix("/preload")
        .ok_or_else(|| ApiError::not_found(format!("no such admin action: {}", path)))?;
    let registry = state.orchestrator.registry();
    info!(model_id = %id, "Preload requested");
    let ctx = RunContext::new(registry.clone(), format!("preload_{}", uuid::Uuid::new_v4().simple()));
    registry.ensure_instance(id, &ctx).await?;
    Ok((
        StatusCode::OK,
        Json(PreloadResponse {
            id: id.to_string(),
            status: registry.status(id)?,
        }),
    ))
}

/// `DELETE /admin/models/{id}`
pub async fn evict_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let evicted = state.orchestrator.registry().evict(&id).await?;
    Ok(Json(EvictResponse { id, evicted }))
}
