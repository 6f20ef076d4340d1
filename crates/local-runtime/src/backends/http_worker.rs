//! Adapter for models served by a local worker speaking the
//! OpenAI-compatible HTTP protocol.
//!
//! The worker is either launched for the model by the supervisor or shared
//! and started by someone else; either way its base URL arrives through the
//! run context.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::adapter::{BackendAdapter, Fragment, FragmentStream, Instance, RunOutput, RunRequest};
use crate::backends::payload::{self, GenerationParams};
use crate::context::RunContext;
use crate::error::RuntimeError;
use crate::model_spec::{Endpoint, ModelSpec};

pub const DEFAULT_AUDIO_CONTENT_TYPE: &str = "audio/wav";
pub const DEFAULT_CHUNK_BYTES: usize = 8192;

/// What `load` hands back: where to reach the worker, and under which name.
#[derive(Debug, Clone)]
pub struct WorkerSession {
    pub base_url: String,
    pub model_name: String,
}

impl WorkerSession {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

pub struct HttpWorkerAdapter {
    http_client: reqwest::Client,
    chunk_bytes: usize,
}

impl HttpWorkerAdapter {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    async fn health_check(&self, session: &WorkerSession) -> anyhow::Result<()> {
        let url = session.url("/health");
        let resp = self
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Health check failed: {}", e))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Health check returned: {}", resp.status()))
        }
    }

    async fn chat(
        &self,
        session: &WorkerSession,
        spec: &ModelSpec,
        request: &RunRequest,
        max_tokens: Option<u32>,
    ) -> anyhow::Result<RunOutput> {
        let mut params = GenerationParams::from_payload(&request.payload, spec);
        if let Some(max_tokens) = max_tokens {
            params.max_tokens = max_tokens;
        }
        let body = json!({
            "model": session.model_name,
            "messages": payload::chat_messages(&request.payload),
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "stream": request.stream,
        });

        let resp = self
            .http_client
            .post(session.url("/v1/chat/completions"))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Inference request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Inference failed ({}): {}", status, body));
        }

        if !request.stream {
            let response: Value = resp
                .json()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;
            let content = response["choices"][0]["message"]["content"]
                .as_str()
                .unwrap_or("")
                .to_string();
            return Ok(RunOutput::text(content));
        }

        Ok(RunOutput::stream(sse_deltas(resp.bytes_stream())))
    }

    async fn speech(&self, session: &WorkerSession, request: &RunRequest) -> anyhow::Result<RunOutput> {
        let text = payload::speech_text(&request.payload);
        if text.trim().is_empty() {
            return Err(RuntimeError::BadRequest("Input text is required for speech synthesis.".into()).into());
        }
        let voice = payload::resolve_voice(&request.payload);
        debug!(
            voice = %voice.voice,
            language = voice.lang_code,
            text_chars = text.chars().count(),
            "Synthesising speech"
        );

        let body = json!({
            "model": session.model_name,
            "input": text,
            "voice": voice.voice,
            "lang_code": voice.lang_code,
            "response_format": "wav",
        });
        let resp = self
            .http_client
            .post(session.url("/v1/audio/speech"))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Speech request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Speech synthesis failed ({}): {}", status, body));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_AUDIO_CONTENT_TYPE)
            .to_string();
        let audio = resp
            .bytes()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read audio: {}", e))?;
        if audio.is_empty() {
            anyhow::bail!("No audio generated");
        }

        if request.stream {
            Ok(RunOutput::binary_stream(chunked(audio, self.chunk_bytes), content_type))
        } else {
            Ok(RunOutput::binary(audio, content_type))
        }
    }
}

/// Pop the next complete line off `buffer`, without its line ending.
///
/// Lines are split on raw bytes so a character cut across network chunks is
/// only decoded once both halves have arrived.
fn next_line(buffer: &mut BytesMut) -> Option<anyhow::Result<String>> {
    let newline_pos = buffer.iter().position(|&b| b == b'\n')?;
    let line = buffer.split_to(newline_pos + 1);
    Some(
        std::str::from_utf8(&line[..newline_pos])
            .map(|text| text.trim().to_string())
            .map_err(|e| anyhow::anyhow!("Stream line is not valid UTF-8: {}", e)),
    )
}

/// Text deltas from an OpenAI-style SSE body, until `[DONE]`.
fn sse_deltas<S, E>(byte_stream: S) -> FragmentStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let sse_stream = async_stream::try_stream! {
        let mut buffer = BytesMut::new();
        futures_util::pin_mut!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result.map_err(|e| anyhow::anyhow!("Stream read error: {}", e))?;
            buffer.extend_from_slice(&chunk);

            while let Some(line) = next_line(&mut buffer) {
                let line = line?;
                let data = match line.strip_prefix("data:") {
                    Some(data) => data.trim(),
                    None => continue,
                };
                if data == "[DONE]" {
                    return;
                }
                let event: Value = serde_json::from_str(data)
                    .map_err(|e| anyhow::anyhow!("Malformed stream event: {}", e))?;
                if let Some(message) = event["error"]["message"].as_str() {
                    Err(anyhow::anyhow!("Worker reported: {}", message))?;
                }
                if let Some(text) = event["choices"][0]["delta"]["content"].as_str() {
                    if !text.is_empty() {
                        yield Fragment::text(text);
                    }
                }
            }
        }
    };
    Box::pin(sse_stream)
}

/// Split a finished buffer into fixed-size fragments. Slices share `data`.
pub fn chunked(data: Bytes, chunk_bytes: usize) -> FragmentStream {
    let step = chunk_bytes.max(1);
    let chunks: Vec<anyhow::Result<Fragment>> = (0..data.len())
        .step_by(step)
        .map(|start| Ok(Fragment::binary(data.slice(start..(start + step).min(data.len())))))
        .collect();
    Box::pin(futures::stream::iter(chunks))
}

fn spec_of<'a>(ctx: &'a RunContext) -> anyhow::Result<&'a ModelSpec> {
    ctx.spec()
        .ok_or_else(|| anyhow::anyhow!("run context is not scoped to a model"))
}

#[async_trait]
impl BackendAdapter for HttpWorkerAdapter {
    async fn load(&self, ctx: &RunContext) -> anyhow::Result<Instance> {
        let spec = spec_of(ctx)?;
        let base_url = ctx.worker_url().ok_or_else(|| {
            anyhow::anyhow!("no worker URL for {} (set LOCAL_RUNTIME_WORKER_URL)", spec.id)
        })?;
        let model_name = if spec.backend.model_ref.is_empty() {
            spec.api.advertised_model_name.clone()
        } else {
            spec.backend.model_ref.clone()
        };
        let session = WorkerSession {
            base_url: base_url.to_string(),
            model_name,
        };
        self.health_check(&session).await?;
        info!("Worker for {} reachable at {}", spec.id, session.base_url);
        Ok(Instance::new(session))
    }

    async fn warmup(&self, instance: &Instance, ctx: &RunContext) -> anyhow::Result<()> {
        let spec = spec_of(ctx)?;
        let session = instance.expect_type::<WorkerSession>()?;
        let request = RunRequest::new(&spec.id, json!({"input": "Hello."}))
            .with_request_id(ctx.request_id());
        match spec.api.endpoint {
            Endpoint::AudioSpeech => self.speech(session, &request).await.map(|_| ()),
            _ => self.chat(session, spec, &request, Some(1)).await.map(|_| ()),
        }
    }

    async fn run(&self, request: &RunRequest, ctx: &RunContext) -> anyhow::Result<RunOutput> {
        let spec = spec_of(ctx)?;
        let instance = ctx.ensure_instance(&request.model).await?;
        let session = instance.expect_type::<WorkerSession>()?;
        match spec.api.endpoint {
            Endpoint::AudioSpeech => self.speech(session, request).await,
            Endpoint::Responses | Endpoint::ChatCompletions => self.chat(session, spec, request, None).await,
            other => Err(anyhow::anyhow!("{:?} is not served by the HTTP worker adapter", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Loader;
    use crate::model_spec::{Accelerator, ExecutionMode, ModelKind};
    use crate::orchestrator::{Orchestrator, RunResult};
    use crate::platform::Environment;
    use crate::pool::InferencePool;
    use crate::registry::{ModelRegistry, RegistryOptions};
    use crate::stream::StreamEvent;
    use crate::supervisor::ProcessSupervisor;
    use std::sync::Arc;

    fn shared_worker_spec(id: &str, kind: ModelKind) -> ModelSpec {
        let mut spec = ModelSpec::new(id, kind).with_platforms(["linux-x64"]).with_concurrency(2);
        spec.execution.mode = ExecutionMode::Subprocess;
        spec
    }

    fn orchestrator(worker_url: &str, specs: Vec<ModelSpec>, chunk_bytes: usize) -> Orchestrator {
        let env = Environment::fixed("linux-x64", vec![Accelerator::Cpu]);
        let adapter: Arc<dyn BackendAdapter> = Arc::new(HttpWorkerAdapter::new(chunk_bytes));
        let loader = specs
            .into_iter()
            .fold(Loader::builder(env), |b, s| b.register(s, adapter.clone()))
            .build()
            .unwrap();
        Orchestrator::new(ModelRegistry::new(
            loader,
            ProcessSupervisor::new(Duration::from_secs(1), Duration::from_millis(20)),
            InferencePool::new(1).unwrap(),
            RegistryOptions {
                enable_warmup: true,
                shared_worker_url: Some(worker_url.to_string()),
            },
        ))
    }

    #[test]
    fn test_chunked_covers_buffer() {
        let data = Bytes::from((0..20u8).collect::<Vec<_>>());
        let chunks: Vec<Fragment> = futures::executor::block_on(
            chunked(data.clone(), 8).map(|f| f.unwrap()).collect::<Vec<_>>(),
        );
        assert_eq!(chunks.len(), 3);
        let mut joined = Vec::new();
        for chunk in chunks {
            if let Fragment::Binary { data } = chunk {
                joined.extend_from_slice(&data);
            }
        }
        assert_eq!(joined, data.to_vec());
    }

    #[tokio::test]
    async fn test_chat_non_streaming() {
        let mut server = mockito::Server::new_async().await;
        let _health = server.mock("GET", "/health").with_status(200).create_async().await;
        let completions = server
            .mock("POST", "/v1/chat/completions")
            .match_body(mockito::Matcher::PartialJson(json!({
                "model": "qwen3-hf",
                "stream": false
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"Hi there"}}]}"#)
            .create_async()
            .await;

        let orch = orchestrator(&server.url(), vec![shared_worker_spec("local//llm/qwen3-hf", ModelKind::Llm)], 8192);
        let result = orch
            .run(RunRequest::new("qwen3-hf", json!({"input": "Hello"})))
            .await
            .unwrap();
        let response = result.into_response().unwrap();
        assert_eq!(response.output_text, "Hi there");
        assert_eq!(response.model, "local//llm/qwen3-hf");
        completions.assert_async().await;
    }

    #[tokio::test]
    async fn test_chat_streaming_parses_sse() {
        let mut server = mockito::Server::new_async().await;
        let _health = server.mock("GET", "/health").with_status(200).create_async().await;
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let _completions = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse)
            .create_async()
            .await;

        let orch = orchestrator(&server.url(), vec![shared_worker_spec("local//llm/qwen3-hf", ModelKind::Llm)], 8192);
        let events: Vec<StreamEvent> = match orch
            .run(RunRequest::new("local//llm/qwen3-hf", json!({"input": "Hi"})).streaming(true))
            .await
            .unwrap()
        {
            RunResult::Events(events) => events.collect().await,
            other => panic!("unexpected: {:?}", other),
        };
        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["created", "delta", "delta", "done", "completed"]);
        match events.last() {
            Some(StreamEvent::Completed(response)) => assert_eq!(response.output_text, "Hello"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    fn texts(fragments: Vec<anyhow::Result<Fragment>>) -> Vec<String> {
        fragments
            .into_iter()
            .map(|f| match f.unwrap() {
                Fragment::Text { text } => text,
                Fragment::Binary { .. } => panic!("binary fragment in chat stream"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sse_character_split_across_chunks() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n\ndata: [DONE]\n\n".as_bytes();
        // Cut between the two bytes of 'é'.
        let cut = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::copy_from_slice(&body[..cut])),
            Ok(Bytes::copy_from_slice(&body[cut..])),
        ];
        let fragments: Vec<_> = sse_deltas(futures::stream::iter(chunks)).collect().await;
        assert_eq!(texts(fragments).concat(), "café");
    }

    #[tokio::test]
    async fn test_sse_lines_reassembled_byte_by_byte() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"日本\"}}]}\r\n\r\ndata: {\"choices\":[{\"delta\":{\"content\":\"語\"}}]}\n\ndata: [DONE]\n\n";
        let chunks: Vec<Result<Bytes, std::io::Error>> = body
            .as_bytes()
            .iter()
            .map(|b| Ok(Bytes::copy_from_slice(&[*b])))
            .collect();
        let fragments: Vec<_> = sse_deltas(futures::stream::iter(chunks)).collect().await;
        assert_eq!(texts(fragments), vec!["日本", "語"]);
    }

    #[tokio::test]
    async fn test_sse_invalid_utf8_is_stream_error() {
        let mut line = b"data: {\"choices\":[{\"delta\":{\"content\":\"".to_vec();
        line.extend_from_slice(&[0xFF, 0xFE]);
        line.extend_from_slice(b"\"}}]}\n\n");
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from(line))];
        let fragments: Vec<_> = sse_deltas(futures::stream::iter(chunks)).collect().await;
        assert_eq!(fragments.len(), 1);
        let err = fragments[0].as_ref().unwrap_err();
        assert!(err.to_string().contains("UTF-8"), "got {}", err);
    }

    #[tokio::test]
    async fn test_speech_stream_reassembles_audio() {
        let audio: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut server = mockito::Server::new_async().await;
        let _health = server.mock("GET", "/health").with_status(200).create_async().await;
        let _speech = server
            .mock("POST", "/v1/audio/speech")
            .match_body(mockito::Matcher::PartialJson(json!({"voice": "ff_siwis", "lang_code": "f"})))
            .with_status(200)
            .with_header("content-type", "audio/wav")
            .with_body(audio.clone())
            .create_async()
            .await;

        let orch = orchestrator(
            &server.url(),
            vec![shared_worker_spec("local//tts/kokoro-local", ModelKind::Tts)],
            4096,
        );
        let request = RunRequest::new("kokoro-local", json!({"input": "Bonjour", "lang": "fr"})).streaming(true);
        let events: Vec<StreamEvent> = orch.run(request).await.unwrap().into_events().unwrap().collect().await;

        let mut joined = Vec::new();
        let mut deltas = 0;
        for event in &events {
            if let StreamEvent::Delta(d) = event {
                if let Fragment::Binary { data } = &d.delta {
                    joined.extend_from_slice(data);
                    deltas += 1;
                }
            }
        }
        assert_eq!(deltas, 5);
        assert_eq!(joined, audio);
        match events.last() {
            Some(StreamEvent::Completed(response)) => {
                let attached = response.audio.as_ref().unwrap();
                assert_eq!(attached.content_type, "audio/wav");
                assert_eq!(attached.data.to_vec(), audio);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_speech_input_is_bad_request() {
        let mut server = mockito::Server::new_async().await;
        let _health = server.mock("GET", "/health").with_status(200).create_async().await;
        let orch = orchestrator(
            &server.url(),
            vec![shared_worker_spec("local//tts/kokoro-local", ModelKind::Tts)],
            8192,
        );
        let err = orch
            .run(RunRequest::new("local//tts/kokoro-local", json!({"input": "  "})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }

    #[tokio::test]
    async fn test_unreachable_worker_fails_load() {
        let mut server = mockito::Server::new_async().await;
        let _health = server.mock("GET", "/health").with_status(503).create_async().await;
        let orch = orchestrator(
            &server.url(),
            vec![shared_worker_spec("local//llm/qwen3-hf", ModelKind::Llm)],
            8192,
        );
        let err = orch
            .run(RunRequest::new("local//llm/qwen3-hf", json!({"input": "Hello"})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "load_error");
        assert_eq!(
            orch.registry().status("local//llm/qwen3-hf").unwrap(),
            crate::registry::LifecycleStatus::Failed
        );
    }
}
