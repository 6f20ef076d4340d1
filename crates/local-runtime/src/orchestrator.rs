//! Request entry point: instance, slot, `run`, then normalisation.

use std::fmt;

use tokio::time::{timeout_at, Instant};
use tracing::{info, warn, Instrument};

use crate::adapter::RunRequest;
use crate::context::RunContext;
use crate::error::{Result, RuntimeError};
use crate::metrics;
use crate::registry::{acquire_slot, Guarded, ModelRegistry};
use crate::stream::{EventStream, ResponseObject, StreamAdapter};

/// Event stream that keeps the model's concurrency slot until dropped.
pub type GuardedEvents = Guarded<EventStream>;

pub enum RunResult {
    Response(ResponseObject),
    Events(GuardedEvents),
}

impl RunResult {
    pub fn into_response(self) -> Option<ResponseObject> {
        match self {
            RunResult::Response(response) => Some(response),
            RunResult::Events(_) => None,
        }
    }

    pub fn into_events(self) -> Option<GuardedEvents> {
        match self {
            RunResult::Events(events) => Some(events),
            RunResult::Response(_) => None,
        }
    }
}

impl fmt::Debug for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunResult::Response(response) => f.debug_tuple("Response").field(&response.id).finish(),
            RunResult::Events(events) => f.debug_tuple("Events").field(&events.model_id()).finish(),
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: ModelRegistry,
}

impl Orchestrator {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Serve one request. `request.model` may be an id or an advertised name.
    ///
    /// For streaming requests the slot is held by the returned event stream,
    /// so abandoning the stream frees it.
    pub async fn run(&self, request: RunRequest) -> Result<RunResult> {
        let ctx = RunContext::new(self.registry.clone(), request.request_id.clone());
        let span = ctx.span().clone();
        self.run_with(request, ctx).instrument(span).await
    }

    async fn run_with(&self, mut request: RunRequest, ctx: RunContext) -> Result<RunResult> {
        let model = self.registry.loader().resolve_name(&request.model)?;
        request.model = model.spec.id.clone();
        let entry = self.registry.entry(&request.model)?;
        let spec = entry.model.spec.clone();

        if let Some(max) = spec.limits.max_input_bytes() {
            let size = serde_json::to_vec(&request.payload).map(|b| b.len()).unwrap_or(0);
            if size > max {
                return Err(RuntimeError::BadRequest(format!(
                    "input is {} bytes, model {} accepts at most {}",
                    size, spec.id, max
                )));
            }
        }

        self.registry.ensure_entry(&entry, &ctx).await?;
        let guard = match acquire_slot(&entry).await {
            Ok(guard) => guard,
            Err(e) => {
                metrics::inc_runs(&spec.id, "busy");
                return Err(e);
            }
        };

        // Shared with everything the adapter offloads, so a run that times
        // out keeps its slot until that work has really stopped.
        let lease = guard.into_lease();
        let scoped = ctx.scoped(&entry.model, entry.worker_url()).with_lease(lease.clone());
        let deadline = Instant::now() + spec.limits.timeout();
        let started = Instant::now();
        let output = match timeout_at(deadline, entry.model.adapter.run(&request, &scoped)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                metrics::inc_runs(&spec.id, "failed");
                let err = RuntimeError::from_run_failure(&spec.id, e);
                warn!(model_id = %spec.id, "Run failed: {}", err);
                return Err(err);
            }
            Err(_) => {
                metrics::inc_runs(&spec.id, "failed");
                warn!(
                    model_id = %spec.id,
                    "Run timed out; slot stays held until offloaded work stops"
                );
                return Err(RuntimeError::generation(
                    &spec.id,
                    format!("no output within {}s", spec.limits.timeout_sec),
                ));
            }
        };

        let adapter = StreamAdapter::new(&spec.id, &request.request_id).with_deadline(deadline);
        if request.stream {
            info!(model_id = %spec.id, "Streaming response");
            return Ok(RunResult::Events(lease.hold(adapter.into_events(output))));
        }

        let response = adapter.into_response(output).await;
        drop(scoped);
        drop(lease);
        let response = response?;
        info!(
            model_id = %spec.id,
            duration_ms = started.elapsed().as_millis() as u64,
            "Run completed"
        );
        Ok(RunResult::Response(response))
    }
}
