//! HTTP front door. Handlers only translate between HTTP and the
//! orchestrator; every decision about models happens below.

pub mod admin;
pub mod error;
pub mod models;
pub mod responses;
pub mod speech;

use axum::{
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use serde_json::Value;
use std::time::Instant;

use crate::adapter::{LoadedModel, RunRequest};
use crate::model_spec::{Endpoint, ModelKind};
use crate::orchestrator::Orchestrator;

pub use error::ApiError;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }
}

/// Routes without middleware; `server` adds the layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/metrics", get(admin::metrics))
        .route("/v1/models", get(models::list_models))
        .route("/v1/responses", post(responses::create_response))
        .route("/v1/audio/speech", post(speech::create_speech))
        // Model ids contain slashes, hence the wildcards.
        .route(
            "/admin/models/*path",
            post(admin::preload_model).delete(admin::evict_model),
        )
        .with_state(state)
}

/// Build the run request for an endpoint: pick the model named in the body
/// (or the default for `kind`), check it answers `accepted`, and carry the
/// caller's request id when one was sent.
pub(crate) fn build_request(
    state: &AppState,
    headers: &HeaderMap,
    payload: Value,
    kind: ModelKind,
    accepted: &[Endpoint],
) -> Result<RunRequest, ApiError> {
    if !payload.is_object() {
        return Err(ApiError::bad_request("request body must be a JSON object"));
    }
    let loader = state.orchestrator.registry().loader();
    let model: LoadedModel = match payload.get("model").and_then(Value::as_str).filter(|m| !m.is_empty()) {
        Some(name) => loader.resolve_name(name)?,
        None => loader
            .default_model(kind)
            .ok_or_else(|| ApiError::not_found(format!("no {} model is available on this machine", kind)))?,
    };
    if !accepted.contains(&model.spec.api.endpoint) {
        return Err(ApiError::bad_request(format!(
            "model {} does not serve this endpoint",
            model.spec.id
        )));
    }

    let stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let mut request = RunRequest::new(model.spec.id.clone(), payload).streaming(stream);
    if let Some(id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        request = request.with_request_id(id);
    }
    Ok(request)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::adapter::BackendAdapter;
    use crate::backends::{echo_spec, EchoAdapter};
    use crate::loader::Loader;
    use crate::model_spec::{Accelerator, ModelSpec};
    use crate::platform::Environment;
    use crate::pool::InferencePool;
    use crate::registry::{ModelRegistry, RegistryOptions};
    use crate::supervisor::ProcessSupervisor;
    use std::sync::Arc;
    use std::time::Duration;

    /// Router over the echo model plus any extra specs, all served by echo.
    pub fn echo_router(extra: Vec<ModelSpec>) -> (Router, AppState) {
        let echo: Arc<dyn BackendAdapter> = Arc::new(EchoAdapter::default());
        let mut models = vec![(echo_spec(), echo.clone())];
        models.extend(extra.into_iter().map(|s| (s, echo.clone())));
        router_with(models)
    }

    pub fn router_with(models: Vec<(ModelSpec, Arc<dyn BackendAdapter>)>) -> (Router, AppState) {
        let env = Environment::fixed("linux-x64", vec![Accelerator::Cpu]);
        let loader = models
            .into_iter()
            .fold(Loader::builder(env), |b, (spec, adapter)| b.register(spec, adapter))
            .build()
            .unwrap();
        let registry = ModelRegistry::new(
            loader,
            ProcessSupervisor::new(Duration::from_secs(1), Duration::from_millis(20)),
            InferencePool::new(2).unwrap(),
            RegistryOptions::default(),
        );
        let state = AppState::new(Orchestrator::new(registry));
        (router(state.clone()), state)
    }
}
