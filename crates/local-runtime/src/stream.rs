//! Normalises adapter output into one response shape and one event protocol.
//!
//! Event order per request is fixed:
//! `created`, then any number of `delta`, then either `done` + `completed`
//! or a single `error`. Nothing follows the terminal event.

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapter::{serialize_base64, Content, Fragment, FragmentStream, RunOutput};
use crate::error::{Result, RuntimeError};
use crate::metrics;

/// Content type reported for binary output whose adapter did not name one.
pub const DEFAULT_BINARY_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputText {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub role: &'static str,
    pub content: Vec<OutputText>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioAttachment {
    pub content_type: String,
    #[serde(serialize_with = "serialize_base64")]
    pub data: Bytes,
}

/// The finished (or in-progress) response handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseObject {
    pub id: String,
    pub object: &'static str,
    pub created_at: i64,
    pub model: String,
    pub request_id: String,
    pub status: ResponseStatus,
    pub output_text: String,
    pub output: Vec<OutputMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioAttachment>,
}

impl ResponseObject {
    pub fn new(model: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            object: "response",
            created_at: chrono::Utc::now().timestamp(),
            model: model.into(),
            request_id: request_id.into(),
            status: ResponseStatus::InProgress,
            output_text: String::new(),
            output: vec![OutputMessage {
                kind: "message",
                role: "assistant",
                content: vec![OutputText {
                    kind: "output_text",
                    text: String::new(),
                }],
            }],
            audio: None,
        }
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if let Some(part) = self.output.first_mut().and_then(|m| m.content.first_mut()) {
            part.text = text.clone();
        }
        self.output_text = text;
    }

    pub fn set_audio(&mut self, data: impl Into<Bytes>, content_type: impl Into<String>) {
        self.audio = Some(AudioAttachment {
            content_type: content_type.into(),
            data: data.into(),
        });
    }

    /// Attach `content` at its canonical place.
    pub fn set_content(&mut self, content: &Content) {
        match content {
            Content::Text { text } => self.set_text(text.clone()),
            Content::Binary { content_type, data } => self.set_audio(data.clone(), content_type.clone()),
        }
    }

    /// The content attached so far, text unless audio was set.
    pub fn content(&self) -> Content {
        match &self.audio {
            Some(audio) => Content::binary(audio.data.clone(), audio.content_type.clone()),
            None => Content::text(self.output_text.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaData {
    pub id: String,
    pub delta: Fragment,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoneData {
    pub id: String,
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorData {
    pub id: String,
    pub error: ErrorBody,
}

/// One envelope event. Serialises as `{"kind": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Created(ResponseObject),
    Delta(DeltaData),
    Done(DoneData),
    Completed(ResponseObject),
    Error(ErrorData),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Created(_) => "created",
            StreamEvent::Delta(_) => "delta",
            StreamEvent::Done(_) => "done",
            StreamEvent::Completed(_) => "completed",
            StreamEvent::Error(_) => "error",
        }
    }

    /// Event name on the SSE wire.
    pub fn sse_name(&self) -> &'static str {
        match self {
            StreamEvent::Created(_) => "response.created",
            StreamEvent::Delta(DeltaData {
                delta: Fragment::Binary { .. },
                ..
            }) => "response.output_audio.delta",
            StreamEvent::Delta(_) => "response.output_text.delta",
            StreamEvent::Done(_) => "response.output_text.done",
            StreamEvent::Completed(_) => "response.completed",
            StreamEvent::Error(_) => "response.error",
        }
    }

    pub fn response_id(&self) -> &str {
        match self {
            StreamEvent::Created(r) | StreamEvent::Completed(r) => &r.id,
            StreamEvent::Delta(d) => &d.id,
            StreamEvent::Done(d) => &d.id,
            StreamEvent::Error(e) => &e.id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed(_) | StreamEvent::Error(_))
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Running total of a fragment sequence. A sequence is text or binary,
/// never both.
#[derive(Debug, Default)]
enum Accumulator {
    #[default]
    Empty,
    Text(String),
    Binary(BytesMut),
}

impl Accumulator {
    fn push(&mut self, fragment: &Fragment) -> anyhow::Result<()> {
        match fragment {
            Fragment::Text { text } => match self {
                Accumulator::Empty => *self = Accumulator::Text(text.clone()),
                Accumulator::Text(acc) => acc.push_str(text),
                Accumulator::Binary(_) => anyhow::bail!("backend mixed text and binary fragments in one stream"),
            },
            Fragment::Binary { data } => match self {
                Accumulator::Empty => *self = Accumulator::Binary(BytesMut::from(&data[..])),
                Accumulator::Binary(acc) => acc.extend_from_slice(data),
                Accumulator::Text(_) => anyhow::bail!("backend mixed text and binary fragments in one stream"),
            },
        }
        Ok(())
    }

    fn into_content(self, content_type: Option<&str>) -> Content {
        let binary_type = content_type.unwrap_or(DEFAULT_BINARY_CONTENT_TYPE);
        match self {
            Accumulator::Empty if content_type.is_some() => Content::binary(Bytes::new(), binary_type),
            Accumulator::Empty => Content::text(String::new()),
            Accumulator::Text(text) => Content::text(text),
            Accumulator::Binary(data) => Content::binary(data.freeze(), binary_type),
        }
    }
}

fn fragment_of(content: &Content) -> Fragment {
    match content {
        Content::Text { text } => Fragment::text(text.clone()),
        Content::Binary { data, .. } => Fragment::binary(data.clone()),
    }
}

async fn next_fragment(
    fragments: &mut FragmentStream,
    deadline: Option<Instant>,
) -> Option<anyhow::Result<Fragment>> {
    match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, fragments.next()).await {
            Ok(next) => next,
            Err(_) => Some(Err(anyhow::anyhow!("generation exceeded the model timeout"))),
        },
        None => fragments.next().await,
    }
}

/// Wraps the output of one `run` call.
#[derive(Debug, Clone)]
pub struct StreamAdapter {
    model_id: String,
    request_id: String,
    deadline: Option<Instant>,
}

impl StreamAdapter {
    pub fn new(model_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            request_id: request_id.into(),
            deadline: None,
        }
    }

    /// Give up waiting for further fragments at `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Finished response, for callers that did not ask to stream. A streamed
    /// output is drained first.
    pub async fn into_response(self, output: RunOutput) -> Result<ResponseObject> {
        let mut response = ResponseObject::new(&self.model_id, &self.request_id);
        let content = match output {
            RunOutput::Complete(content) => content,
            RunOutput::Stream {
                mut fragments,
                content_type,
            } => {
                let mut acc = Accumulator::default();
                loop {
                    let pushed = match next_fragment(&mut fragments, self.deadline).await {
                        None => break,
                        Some(Ok(fragment)) if fragment.is_empty() => continue,
                        Some(Ok(fragment)) => acc.push(&fragment),
                        Some(Err(e)) => Err(e),
                    };
                    if let Err(e) = pushed {
                        metrics::inc_runs(&self.model_id, "failed");
                        return Err(RuntimeError::from_run_failure(&self.model_id, e));
                    }
                }
                acc.into_content(content_type.as_deref())
            }
        };
        response.set_content(&content);
        response.status = ResponseStatus::Completed;
        metrics::inc_runs(&self.model_id, "completed");
        Ok(response)
    }

    /// Envelope events. A single finished value becomes one delta.
    pub fn into_events(self, output: RunOutput) -> EventStream {
        let stream = async_stream::stream! {
            let mut response = ResponseObject::new(&self.model_id, &self.request_id);
            let id = response.id.clone();
            yield StreamEvent::Created(response.clone());

            let content = match output {
                RunOutput::Complete(content) => {
                    let fragment = fragment_of(&content);
                    if !fragment.is_empty() {
                        yield StreamEvent::Delta(DeltaData { id: id.clone(), delta: fragment });
                    }
                    content
                }
                RunOutput::Stream { mut fragments, content_type } => {
                    let mut acc = Accumulator::default();
                    let mut failure = None;
                    while let Some(next) = next_fragment(&mut fragments, self.deadline).await {
                        let fragment = match next {
                            Ok(fragment) => fragment,
                            Err(e) => {
                                failure = Some(e);
                                break;
                            }
                        };
                        if fragment.is_empty() {
                            continue;
                        }
                        if let Err(e) = acc.push(&fragment) {
                            failure = Some(e);
                            break;
                        }
                        yield StreamEvent::Delta(DeltaData { id: id.clone(), delta: fragment });
                    }
                    // Stop the producer before reporting anything else.
                    drop(fragments);
                    if let Some(e) = failure {
                        let err = RuntimeError::from_run_failure(&self.model_id, e);
                        warn!(model_id = %self.model_id, request_id = %self.request_id, "Stream failed: {}", err);
                        metrics::inc_runs(&self.model_id, "failed");
                        yield StreamEvent::Error(ErrorData {
                            id,
                            error: ErrorBody { code: err.code(), message: err.to_string() },
                        });
                        return;
                    }
                    acc.into_content(content_type.as_deref())
                }
            };

            response.set_content(&content);
            response.status = ResponseStatus::Completed;
            yield StreamEvent::Done(DoneData { id: id.clone(), content });
            metrics::inc_runs(&self.model_id, "completed");
            debug!(model_id = %self.model_id, request_id = %self.request_id, "Stream completed");
            yield StreamEvent::Completed(response);
        };
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;

    fn fragments(items: Vec<anyhow::Result<Fragment>>) -> FragmentStream {
        Box::pin(stream::iter(items))
    }

    async fn collect(output: RunOutput) -> Vec<StreamEvent> {
        StreamAdapter::new("m", "req_1").into_events(output).collect().await
    }

    #[tokio::test]
    async fn test_stream_envelope_order_and_accumulation() {
        let output = RunOutput::stream(fragments(vec![
            Ok(Fragment::text("Hel")),
            Ok(Fragment::text("")),
            Ok(Fragment::text("lo")),
        ]));
        let events = collect(output).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["created", "delta", "delta", "done", "completed"]);

        let id = events[0].response_id().to_string();
        assert!(id.starts_with("resp_"));
        assert!(events.iter().all(|e| e.response_id() == id));

        match &events[4] {
            StreamEvent::Completed(response) => {
                assert_eq!(response.output_text, "Hello");
                assert_eq!(response.output[0].content[0].text, "Hello");
                assert_eq!(response.status, ResponseStatus::Completed);
                assert_eq!(response.request_id, "req_1");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mid_stream_failure_ends_with_error() {
        let output = RunOutput::stream(fragments(vec![
            Ok(Fragment::text("partial")),
            Err(anyhow::anyhow!("decoder crashed")),
            Ok(Fragment::text("never seen")),
        ]));
        let events = collect(output).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["created", "delta", "error"]);
        match &events[2] {
            StreamEvent::Error(data) => {
                assert_eq!(data.error.code, "generation_error");
                assert!(data.error.message.contains("decoder crashed"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_stream_completes_with_empty_text() {
        let events = collect(RunOutput::stream(fragments(vec![]))).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["created", "done", "completed"]);
        assert_eq!(
            events[1],
            StreamEvent::Done(DoneData {
                id: events[0].response_id().to_string(),
                content: Content::text(""),
            })
        );
    }

    #[tokio::test]
    async fn test_complete_output_becomes_single_delta() {
        let events = collect(RunOutput::text("Hi there")).await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["created", "delta", "done", "completed"]);
        assert_eq!(events[1].sse_name(), "response.output_text.delta");
    }

    #[tokio::test]
    async fn test_binary_fragments_concatenate() {
        let output = RunOutput::binary_stream(
            fragments(vec![
                Ok(Fragment::binary(vec![1u8, 2, 3])),
                Ok(Fragment::binary(vec![4u8])),
            ]),
            "audio/wav",
        );
        let events = collect(output).await;
        assert_eq!(events[1].sse_name(), "response.output_audio.delta");
        match events.last() {
            Some(StreamEvent::Completed(response)) => {
                let audio = response.audio.as_ref().unwrap();
                assert_eq!(audio.content_type, "audio/wav");
                assert_eq!(&audio.data[..], &[1, 2, 3, 4]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mixed_fragment_types_are_an_error() {
        let output = RunOutput::stream(fragments(vec![
            Ok(Fragment::text("a")),
            Ok(Fragment::binary(vec![1u8])),
        ]));
        let events = collect(output).await;
        assert_eq!(events.last().unwrap().kind(), "error");

        let output = RunOutput::stream(fragments(vec![
            Ok(Fragment::text("a")),
            Ok(Fragment::binary(vec![1u8])),
        ]));
        let err = StreamAdapter::new("m", "req_1").into_response(output).await.unwrap_err();
        assert_eq!(err.code(), "generation_error");
    }

    #[tokio::test]
    async fn test_into_response_drains_streams() {
        let output = RunOutput::stream(fragments(vec![Ok(Fragment::text("a")), Ok(Fragment::text("b"))]));
        let response = StreamAdapter::new("m", "req_1").into_response(output).await.unwrap();
        assert_eq!(response.output_text, "ab");
        assert_eq!(response.object, "response");
        assert!(response.audio.is_none());
    }

    #[tokio::test]
    async fn test_deadline_turns_stalled_stream_into_error() {
        let stalled: FragmentStream = Box::pin(
            stream::iter(vec![Ok(Fragment::text("first"))]).chain(stream::pending()),
        );
        let adapter = StreamAdapter::new("m", "req_1")
            .with_deadline(Instant::now() + Duration::from_millis(100));
        let events: Vec<StreamEvent> = adapter.into_events(RunOutput::stream(stalled)).collect().await;
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["created", "delta", "error"]);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = StreamEvent::Delta(DeltaData {
            id: "resp_1".into(),
            delta: Fragment::text("hi"),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kind": "delta",
                "data": {"id": "resp_1", "delta": {"type": "text", "text": "hi"}}
            })
        );
    }
}
