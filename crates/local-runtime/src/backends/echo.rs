//! In-process diagnostic backend. Repeats the prompt back, word by word
//! when streaming, on the inference pool like any real in-process model.

use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::adapter::{BackendAdapter, Fragment, Instance, RunOutput, RunRequest};
use crate::backends::payload;
use crate::context::RunContext;
use crate::pool::DEFAULT_PUMP_CAPACITY;

/// Upper bound on the per-word delay a caller may ask for.
const MAX_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone)]
pub struct EchoModel {
    prefix: String,
}

impl EchoModel {
    fn reply(&self, prompt: &str) -> String {
        format!("{}{}", self.prefix, prompt)
    }
}

pub struct EchoAdapter {
    prefix: String,
}

impl EchoAdapter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

impl Default for EchoAdapter {
    fn default() -> Self {
        Self::new("")
    }
}

fn delay(payload: &Value) -> Duration {
    let ms = payload
        .get("delay_ms")
        .and_then(Value::as_u64)
        .unwrap_or(0)
        .min(MAX_DELAY_MS);
    Duration::from_millis(ms)
}

/// Split keeping the separating whitespace, so deltas concatenate back to
/// the full reply.
fn words(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[async_trait]
impl BackendAdapter for EchoAdapter {
    async fn load(&self, ctx: &RunContext) -> anyhow::Result<Instance> {
        let prefix = self.prefix.clone();
        let model = ctx.pool().run(move || Ok(EchoModel { prefix })).await?;
        Ok(Instance::new(model))
    }

    async fn warmup(&self, instance: &Instance, ctx: &RunContext) -> anyhow::Result<()> {
        let model = instance.expect_type::<EchoModel>()?.clone();
        let reply = ctx.pool().run(move || Ok(model.reply("warmup"))).await?;
        debug!("Echo warmup produced {} chars", reply.len());
        Ok(())
    }

    async fn run(&self, request: &RunRequest, ctx: &RunContext) -> anyhow::Result<RunOutput> {
        let instance = ctx.ensure_instance(&request.model).await?;
        let model = instance.expect_type::<EchoModel>()?.clone();
        let reply = model.reply(&payload::prompt_text(&request.payload));
        let pause = delay(&request.payload);

        if !request.stream {
            let text = ctx
                .pool()
                .run(move || {
                    thread::sleep(pause);
                    Ok(reply)
                })
                .await?;
            return Ok(RunOutput::text(text));
        }

        let fragments = ctx.pool().stream(DEFAULT_PUMP_CAPACITY, move |sink| {
            for word in words(&reply) {
                if sink.is_cancelled() {
                    break;
                }
                thread::sleep(pause);
                sink.send(Fragment::text(word))?;
            }
            Ok(())
        });
        Ok(RunOutput::stream(fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{echo_spec, ECHO_ID};
    use crate::loader::Loader;
    use crate::model_spec::Accelerator;
    use crate::orchestrator::Orchestrator;
    use crate::platform::Environment;
    use crate::pool::InferencePool;
    use crate::registry::{ModelRegistry, RegistryOptions};
    use crate::stream::StreamEvent;
    use crate::supervisor::ProcessSupervisor;
    use futures_util::StreamExt;
    use std::sync::Arc;

    fn orchestrator(prefix: &str) -> Orchestrator {
        let loader = Loader::builder(Environment::fixed("linux-x64", vec![Accelerator::Cpu]))
            .register(echo_spec(), Arc::new(EchoAdapter::new(prefix)))
            .build()
            .unwrap();
        Orchestrator::new(ModelRegistry::new(
            loader,
            ProcessSupervisor::new(Duration::from_secs(1), Duration::from_millis(20)),
            InferencePool::new(1).unwrap(),
            RegistryOptions::default(),
        ))
    }

    #[test]
    fn test_words_keep_whitespace() {
        assert_eq!(words("Hello  big world"), vec!["Hello ", " ", "big ", "world"]);
        assert_eq!(words("Hello  big world").concat(), "Hello  big world");
        assert!(words("").is_empty());
    }

    #[test]
    fn test_delay_is_capped() {
        assert_eq!(delay(&serde_json::json!({})), Duration::ZERO);
        assert_eq!(delay(&serde_json::json!({"delay_ms": 25})), Duration::from_millis(25));
        assert_eq!(delay(&serde_json::json!({"delay_ms": 1_000_000})), Duration::from_millis(MAX_DELAY_MS));
    }

    #[tokio::test]
    async fn test_echo_reply_with_prefix() {
        let orch = orchestrator("> ");
        let result = orch.run(RunRequest::new(ECHO_ID, serde_json::json!({"input": "ping"}))).await;
        let response = tokio_test::assert_ok!(result).into_response().unwrap();
        assert_eq!(response.output_text, "> ping");
    }

    #[tokio::test]
    async fn test_echo_streams_word_deltas() {
        let orch = orchestrator("");
        let request = RunRequest::new(ECHO_ID, serde_json::json!({"input": "a b c"})).streaming(true);
        let events: Vec<StreamEvent> = tokio_test::assert_ok!(orch.run(request).await)
            .into_events()
            .unwrap()
            .collect()
            .await;
        let deltas: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Delta(d) => match &d.delta {
                    Fragment::Text { text } => Some(text.clone()),
                    Fragment::Binary { .. } => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["a ", "b ", "c"]);
        assert_eq!(events.last().map(|e| e.kind()), Some("completed"));
    }
}
