//! Per-request handle passed into every adapter call.

use tracing::Span;

use crate::adapter::{Instance, LoadedModel};
use crate::error::Result;
use crate::model_spec::ModelSpec;
use crate::pool::ScopedPool;
use crate::registry::{ModelRegistry, SlotLease};

/// Created per request (or per preload) and discarded afterwards.
#[derive(Clone)]
pub struct RunContext {
    request_id: String,
    span: Span,
    registry: ModelRegistry,
    model: Option<LoadedModel>,
    worker_url: Option<String>,
    lease: Option<SlotLease>,
}

impl RunContext {
    pub fn new(registry: ModelRegistry, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        let span = tracing::info_span!("request", request_id = %request_id);
        Self {
            request_id,
            span,
            registry,
            model: None,
            worker_url: None,
            lease: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Logging sink. Enter it (or `instrument` with it) so events carry the
    /// request and model ids.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Inference pool. Inside a run, offloaded work keeps the run's slot
    /// until it finishes, even if the run itself has timed out.
    pub fn pool(&self) -> ScopedPool<'_> {
        self.registry.pool().scoped(self.lease.clone())
    }

    /// Spec of the model this context was scoped to, if any.
    pub fn spec(&self) -> Option<&ModelSpec> {
        self.model.as_ref().map(|m| m.spec.as_ref())
    }

    /// Base URL of the worker hosting this model, for subprocess models.
    pub fn worker_url(&self) -> Option<&str> {
        self.worker_url.as_deref()
    }

    /// Shortcut for `registry().ensure_instance(id, self)`.
    pub async fn ensure_instance(&self, model_id: &str) -> Result<Instance> {
        self.registry.ensure_instance(model_id, self).await
    }

    /// Same request, narrowed to one model.
    pub(crate) fn scoped(&self, model: &LoadedModel, worker_url: Option<String>) -> Self {
        let span = tracing::info_span!(
            parent: &self.span,
            "model",
            model_id = %model.spec.id,
        );
        Self {
            request_id: self.request_id.clone(),
            span,
            registry: self.registry.clone(),
            model: Some(model.clone()),
            worker_url,
            lease: self.lease.clone(),
        }
    }

    pub(crate) fn with_lease(mut self, lease: SlotLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// For work that must not count against a run's slot, such as a load.
    pub(crate) fn without_lease(&self) -> Self {
        Self {
            lease: None,
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("request_id", &self.request_id)
            .field("model", &self.model.as_ref().map(|m| m.id()))
            .field("worker_url", &self.worker_url)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}
