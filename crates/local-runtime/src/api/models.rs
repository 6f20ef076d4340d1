//! `GET /v1/models`: the models this machine can serve, best first.

use axum::{extract::State, Json};
use serde::Serialize;

use super::AppState;
use crate::model_spec::{Endpoint, ModelKind, UiParam};
use crate::registry::LifecycleStatus;

#[derive(Debug, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
    pub name: String,
    pub kind: ModelKind,
    pub endpoint: Endpoint,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub priority: i32,
    pub supports_stream: bool,
    pub status: LifecycleStatus,
    pub in_flight: usize,
    pub concurrency: u32,
    pub ui_params: Vec<UiParam>,
}

#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    let registry = state.orchestrator.registry();
    let statuses = registry.snapshot();
    let data = registry
        .loader()
        .discover()
        .into_iter()
        .map(|model| {
            let spec = model.spec.as_ref();
            let row = statuses.iter().find(|s| s.id == spec.id);
            ModelEntry {
                id: spec.id.clone(),
                object: "model",
                owned_by: "local",
                name: spec.api.advertised_model_name.clone(),
                kind: spec.kind,
                endpoint: spec.api.endpoint,
                title: spec.display.title.clone(),
                description: spec.display.description.clone(),
                tags: spec.display.tags.clone(),
                priority: spec.compat.priority,
                supports_stream: spec.api.supports_stream,
                status: row.map(|r| r.status).unwrap_or(LifecycleStatus::Unloaded),
                in_flight: row.map(|r| r.in_flight).unwrap_or(0),
                concurrency: spec.limits.concurrency,
                ui_params: spec.ui_params.clone(),
            }
        })
        .collect();
    Json(ModelList { object: "list", data })
}
