//! The contract every backend implements.
//!
//! A backend is a `(ModelSpec, BackendAdapter)` pair registered with the
//! loader. The orchestrator only ever talks to backends through the three
//! calls below; how a backend sets up its own native dependencies is its
//! own business.

use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize, Serializer};

use crate::context::RunContext;
use crate::model_spec::ModelSpec;

/// Live backend resources for one model id. Opaque to the orchestrator.
///
/// Cloning shares the same underlying value; the registry hands out clones
/// of the single instance it owns.
#[derive(Clone)]
pub struct Instance(Arc<dyn Any + Send + Sync>);

impl Instance {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Like `downcast_ref`, but an error an adapter can bubble up with `?`.
    pub fn expect_type<T: Any>(&self) -> anyhow::Result<&T> {
        self.downcast_ref::<T>().ok_or_else(|| {
            anyhow::anyhow!(
                "instance is not a {}",
                std::any::type_name::<T>()
            )
        })
    }

    /// Whether two handles point at the same loaded instance.
    pub fn same_as(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instance({:p})", Arc::as_ptr(&self.0))
    }
}

/// One inference call as seen by an adapter. Owned by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub model: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub stream: bool,
    pub request_id: String,
}

impl RunRequest {
    pub fn new(model: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            model: model.into(),
            payload,
            stream: false,
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// One piece of incrementally produced output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    Text {
        text: String,
    },
    Binary {
        #[serde(serialize_with = "serialize_base64")]
        data: Bytes,
    },
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Fragment::Text { text: text.into() }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Fragment::Binary { data: data.into() }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Fragment::Text { text } => text.is_empty(),
            Fragment::Binary { data } => data.is_empty(),
        }
    }
}

/// A finished piece of output: either text or a binary attachment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Binary {
        content_type: String,
        #[serde(serialize_with = "serialize_base64")]
        data: Bytes,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn binary(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Content::Binary {
            content_type: content_type.into(),
            data: data.into(),
        }
    }
}

pub(crate) fn serialize_base64<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
}

/// Lazy, forward-only fragment sequence. An `Err` item ends it.
pub type FragmentStream = Pin<Box<dyn Stream<Item = anyhow::Result<Fragment>> + Send>>;

/// What `run` hands back.
pub enum RunOutput {
    /// Single finished value.
    Complete(Content),
    /// Incremental output. `content_type` marks a binary stream.
    Stream {
        fragments: FragmentStream,
        content_type: Option<String>,
    },
}

impl RunOutput {
    pub fn text(text: impl Into<String>) -> Self {
        RunOutput::Complete(Content::text(text))
    }

    pub fn binary(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        RunOutput::Complete(Content::binary(data, content_type))
    }

    pub fn stream(fragments: FragmentStream) -> Self {
        RunOutput::Stream {
            fragments,
            content_type: None,
        }
    }

    pub fn binary_stream(fragments: FragmentStream, content_type: impl Into<String>) -> Self {
        RunOutput::Stream {
            fragments,
            content_type: Some(content_type.into()),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, RunOutput::Stream { .. })
    }
}

impl fmt::Debug for RunOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutput::Complete(content) => f.debug_tuple("Complete").field(content).finish(),
            RunOutput::Stream { content_type, .. } => f
                .debug_struct("Stream")
                .field("content_type", content_type)
                .finish_non_exhaustive(),
        }
    }
}

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Allocate backend resources. Called at most once per load attempt.
    async fn load(&self, ctx: &RunContext) -> anyhow::Result<Instance>;

    /// Cheap inference to force lazy initialisation paths.
    async fn warmup(&self, _instance: &Instance, _ctx: &RunContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// One inference call. Must honour `request.stream`.
    async fn run(&self, request: &RunRequest, ctx: &RunContext) -> anyhow::Result<RunOutput>;
}

/// A spec paired with the code that serves it. Immutable after startup.
#[derive(Clone)]
pub struct LoadedModel {
    pub spec: Arc<ModelSpec>,
    pub adapter: Arc<dyn BackendAdapter>,
    /// Registration order, the tie breaker for equal priorities.
    pub order: usize,
}

impl LoadedModel {
    pub fn id(&self) -> &str {
        &self.spec.id
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("id", &self.spec.id)
            .field("priority", &self.spec.compat.priority)
            .field("order", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_identity() {
        let a = Instance::new(42u32);
        let b = a.clone();
        let c = Instance::new(42u32);
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert_eq!(a.downcast_ref::<u32>(), Some(&42));
        assert!(a.expect_type::<String>().is_err());
    }

    #[test]
    fn test_fragment_serialization() {
        let text = serde_json::to_value(Fragment::text("hi")).unwrap();
        assert_eq!(text, serde_json::json!({"type": "text", "text": "hi"}));

        let bin = serde_json::to_value(Fragment::binary(vec![0u8, 1, 2])).unwrap();
        assert_eq!(bin, serde_json::json!({"type": "binary", "data": "AAEC"}));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = RunRequest::new("m", serde_json::json!({}));
        let b = RunRequest::new("m", serde_json::json!({}));
        assert_ne!(a.request_id, b.request_id);
        assert!(a.request_id.starts_with("req_"));
        assert!(!a.stream);
        assert!(a.streaming(true).stream);
    }
}
