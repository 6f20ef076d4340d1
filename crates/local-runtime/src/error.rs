//! Error taxonomy shared by the loader, registry, supervisor and stream adapter.
//!
//! Adapters report failures as `anyhow::Error`; the orchestrator classifies
//! them into one of the variants below before they reach a caller.

use std::time::Duration;

/// Every failure a caller of the orchestrator can observe.
///
/// `Clone` so that a single failed load can be handed to every caller that
/// was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The model cannot run on this machine (platform, accelerator or resources).
    #[error("model {model_id} is incompatible with this environment: {missing}")]
    IncompatibleEnvironment { model_id: String, missing: String },

    /// No registered spec has this id.
    #[error("model not found: {0}")]
    NotFound(String),

    /// Adapter `load`/`warmup` failed, or a native dependency is missing.
    #[error("failed to load model {model_id}: {message}")]
    LoadError { model_id: String, message: String },

    /// A launched worker did not become healthy in time.
    #[error("worker for model {model_id} was not ready after {timeout:?}")]
    ReadinessTimeout { model_id: String, timeout: Duration },

    /// No concurrency slot became free before the model's timeout.
    #[error("model {model_id} is busy (waited {waited:?} for a slot)")]
    Busy { model_id: String, waited: Duration },

    /// The payload is missing something the backend needs.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Adapter `run` failed, before or during streaming.
    #[error("generation failed for model {model_id}: {message}")]
    GenerationError { model_id: String, message: String },
}

impl RuntimeError {
    pub fn load(model_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        RuntimeError::LoadError {
            model_id: model_id.into(),
            message: err.to_string(),
        }
    }

    pub fn generation(model_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        RuntimeError::GenerationError {
            model_id: model_id.into(),
            message: err.to_string(),
        }
    }

    /// Only `Busy` is worth retrying without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::Busy { .. })
    }

    /// Stable machine-readable code, used by the HTTP front door.
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::IncompatibleEnvironment { .. } => "incompatible_environment",
            RuntimeError::NotFound(_) => "not_found",
            RuntimeError::LoadError { .. } => "load_error",
            RuntimeError::ReadinessTimeout { .. } => "readiness_timeout",
            RuntimeError::Busy { .. } => "busy",
            RuntimeError::BadRequest(_) => "bad_request",
            RuntimeError::GenerationError { .. } => "generation_error",
        }
    }

    /// Classify an adapter `load`/`warmup` failure.
    ///
    /// A `RuntimeError` raised by the adapter itself (or by the supervisor)
    /// keeps its variant; anything else becomes `LoadError`.
    pub(crate) fn from_load_failure(model_id: &str, err: anyhow::Error) -> Self {
        match err.downcast::<RuntimeError>() {
            Ok(inner) => inner,
            Err(other) => RuntimeError::load(model_id, format!("{:#}", other)),
        }
    }

    /// Classify an adapter `run` failure. `BadRequest` survives, the rest
    /// becomes `GenerationError`.
    pub(crate) fn from_run_failure(model_id: &str, err: anyhow::Error) -> Self {
        match err.downcast::<RuntimeError>() {
            Ok(inner @ RuntimeError::BadRequest(_)) => inner,
            Ok(RuntimeError::GenerationError { message, .. }) => {
                RuntimeError::generation(model_id, message)
            }
            Ok(other) => RuntimeError::generation(model_id, other),
            Err(other) => RuntimeError::generation(model_id, format!("{:#}", other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
