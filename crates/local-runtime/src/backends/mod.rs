//! Built-in adapters and the model catalog they serve.

pub mod echo;
pub mod http_worker;
pub mod payload;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::adapter::BackendAdapter;
use crate::config::Config;
use crate::loader::Loader;
use crate::model_spec::{
    self, Accelerator, ExecutionMode, Launch, ModelKind, ModelSpec, ProbeKind, ReadySpec,
};
use crate::platform::Environment;

pub use echo::EchoAdapter;
pub use http_worker::HttpWorkerAdapter;

pub const QWEN3_HF_ID: &str = "local//llm/qwen3-hf";
pub const KOKORO_LOCAL_ID: &str = "local//tts/kokoro-local";
pub const LLAMA_SERVER_ID: &str = "local//llm/llama-server";
pub const ECHO_ID: &str = "local//llm/echo";

const DESKTOP_PLATFORMS: [&str; 4] = ["darwin-arm64", "darwin-x64", "windows-x64", "linux-x64"];

const QWEN3_HF_SPEC: &str = r#"{
    "id": "local//llm/qwen3-hf",
    "kind": "llm",
    "display": {
        "title": "Qwen3 Hugging Face",
        "description": "Local Qwen3 inference via Hugging Face Transformers.",
        "tags": ["qwen", "hf", "local"],
        "icon": "bolt"
    },
    "compat": {
        "platforms": ["darwin-arm64", "darwin-x64", "windows-x64", "linux-x64"],
        "acceleration": ["cpu", "cuda"],
        "priority": 100,
        "requires_ram_gb": 12,
        "requires_vram_gb": 6,
        "disk_gb": 8
    },
    "api": {
        "endpoint": "responses",
        "advertised_model_name": "qwen3-hf",
        "supports_stream": true
    },
    "limits": {
        "timeout_sec": 300,
        "concurrency": 1,
        "max_input_mb": 25,
        "max_output_tokens_default": 2048
    },
    "backend": {
        "provider": "hf",
        "model_ref": "Qwen/Qwen3-4B-Instruct-2507",
        "device_hint": "auto"
    },
    "execution": {"mode": "subprocess", "warmup_on_start": false},
    "launch": {
        "enabled": false,
        "type": "command",
        "explain": "Served by the shared worker process.",
        "cmd": [],
        "ready": {
            "kind": "http",
            "timeout_sec": 60,
            "http_url": "http://127.0.0.1:{port}/health"
        }
    }
}"#;

const KOKORO_LOCAL_SPEC: &str = r#"{
    "id": "local//tts/kokoro-local",
    "kind": "tts",
    "display": {
        "title": "Kokoro Local TTS",
        "description": "Offline Kokoro TTS for quick voice playback.",
        "tags": ["tts", "kokoro", "local"],
        "icon": "waveform"
    },
    "compat": {
        "platforms": ["darwin-arm64", "darwin-x64", "windows-x64", "linux-x64"],
        "acceleration": ["cpu", "cuda", "metal"],
        "priority": 110,
        "requires_ram_gb": 4,
        "requires_vram_gb": 0,
        "disk_gb": 2
    },
    "api": {
        "endpoint": "audio.speech",
        "advertised_model_name": "kokoro-local",
        "supports_stream": true
    },
    "limits": {
        "timeout_sec": 300,
        "concurrency": 2,
        "max_input_mb": 10,
        "max_output_tokens_default": 2048
    },
    "backend": {
        "provider": "kokoro",
        "model_ref": "mlx-community/Kokoro-82M-bf16",
        "device_hint": "auto"
    },
    "execution": {"mode": "subprocess", "warmup_on_start": false},
    "launch": {
        "enabled": false,
        "type": "command",
        "explain": "Served by the shared worker process.",
        "cmd": [],
        "ready": {
            "kind": "http",
            "timeout_sec": 60,
            "http_url": "http://127.0.0.1:{port}/health"
        }
    },
    "ui_params": [
        {"key": "voice", "type": "select", "default": "af_bella", "choices": ["af_bella", "ff_siwis"]},
        {"key": "language", "type": "select", "default": "a", "choices": ["a", "f"]}
    ]
}"#;

/// Specs shipped with the runtime, served by a shared worker.
pub fn builtin_specs() -> anyhow::Result<Vec<ModelSpec>> {
    Ok(vec![
        ModelSpec::from_json_str(QWEN3_HF_SPEC)?,
        ModelSpec::from_json_str(KOKORO_LOCAL_SPEC)?,
    ])
}

/// A `llama-server` started by the runtime itself for `model_path`.
pub fn llama_server_spec(program: &str, model_path: &str) -> ModelSpec {
    let mut spec = ModelSpec::new(LLAMA_SERVER_ID, ModelKind::Llm)
        .with_platforms(DESKTOP_PLATFORMS)
        .with_acceleration(vec![
            Accelerator::Cpu,
            Accelerator::Cuda,
            Accelerator::Metal,
            Accelerator::Vulkan,
        ])
        .with_priority(90)
        .with_launch(Launch {
            enabled: true,
            launch_type: "command".to_string(),
            explain: Some("llama.cpp server launched per model".to_string()),
            env: BTreeMap::new(),
            cmd: [
                program,
                "-m",
                model_path,
                "--host",
                "127.0.0.1",
                "--port",
                "{port}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ready: ReadySpec {
                kind: ProbeKind::Http,
                timeout_sec: 120,
                http_url: Some("http://127.0.0.1:{port}/health".to_string()),
                log_regex: None,
            },
        });
    spec.execution.mode = ExecutionMode::Subprocess;
    spec.display.title = "llama.cpp server".to_string();
    spec.backend.provider = "llama.cpp".to_string();
    spec.backend.model_ref = Path::new(model_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| model_path.to_string());
    spec
}

/// In-process diagnostic model. Lowest priority, so never a default.
pub fn echo_spec() -> ModelSpec {
    let mut spec = ModelSpec::new(ECHO_ID, ModelKind::Llm)
        .with_platforms(DESKTOP_PLATFORMS)
        .with_acceleration(vec![Accelerator::Cpu, Accelerator::Cuda, Accelerator::Metal])
        .with_priority(-100)
        .with_concurrency(4)
        .with_timeout_secs(60)
        .with_warmup_on_start(true);
    spec.display.title = "Echo".to_string();
    spec.display.description = "Repeats the prompt back. For diagnostics.".to_string();
    spec.backend.provider = "echo".to_string();
    spec
}

/// Assemble the loader for this machine from the built-in catalog, the
/// optional extras switched on in `config` and the catalog file.
pub fn build_loader(config: &Config, env: Environment) -> anyhow::Result<Loader> {
    let worker: Arc<dyn BackendAdapter> = Arc::new(HttpWorkerAdapter::new(config.stream_chunk_bytes));
    let mut builder = Loader::builder(env).enforce_resources(config.enforce_resources);

    for spec in builtin_specs()? {
        builder = builder.register(spec, worker.clone());
    }
    if let (Some(program), Some(model_path)) = (&config.llama_bin, &config.llama_model) {
        info!("Registering llama-server for {}", model_path);
        builder = builder.register(llama_server_spec(program, model_path), worker.clone());
    }
    if config.enable_echo {
        builder = builder.register(echo_spec(), Arc::new(EchoAdapter::default()));
    }
    if let Some(path) = &config.models_file {
        for spec in model_spec::load_catalog_file(path)? {
            builder = builder.register(spec, worker.clone());
        }
    }
    builder.build()
}
