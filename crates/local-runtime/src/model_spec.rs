//! Declarative model descriptors.
//!
//! A `ModelSpec` says who a backend is, where it can run, what it answers,
//! how hard it may be driven and how it is started. Specs are immutable once
//! loaded; the serde layout below is the persisted configuration format.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::{Validate, ValidationError};

use crate::platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Llm,
    Tts,
    Stt,
    Embedding,
    #[serde(other)]
    Other,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelKind::Llm => "llm",
            ModelKind::Tts => "tts",
            ModelKind::Stt => "stt",
            ModelKind::Embedding => "embedding",
            ModelKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Compute devices a spec may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    Cuda,
    Metal,
    Rocm,
    Vulkan,
}

impl Accelerator {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "cpu" => Some(Accelerator::Cpu),
            "cuda" => Some(Accelerator::Cuda),
            "metal" | "mps" => Some(Accelerator::Metal),
            "rocm" => Some(Accelerator::Rocm),
            "vulkan" => Some(Accelerator::Vulkan),
            _ => None,
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Accelerator::Cpu => "cpu",
            Accelerator::Cuda => "cuda",
            Accelerator::Metal => "metal",
            Accelerator::Rocm => "rocm",
            Accelerator::Vulkan => "vulkan",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Compat {
    #[validate(length(min = 1, message = "at least one platform is required"))]
    pub platforms: Vec<String>,
    #[validate(length(min = 1, message = "at least one accelerator is required"))]
    pub acceleration: Vec<Accelerator>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub requires_ram_gb: u32,
    #[serde(default)]
    pub requires_vram_gb: u32,
    #[serde(default)]
    pub disk_gb: u32,
}

/// External endpoint family a model answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    #[serde(rename = "responses")]
    Responses,
    #[serde(rename = "chat.completions")]
    ChatCompletions,
    #[serde(rename = "audio.speech")]
    AudioSpeech,
    #[serde(rename = "audio.transcriptions")]
    AudioTranscriptions,
    #[serde(rename = "embeddings")]
    Embeddings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ApiSpec {
    pub endpoint: Endpoint,
    #[validate(length(min = 1))]
    pub advertised_model_name: String,
    #[serde(default)]
    pub supports_stream: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Limits {
    #[validate(range(min = 1))]
    pub timeout_sec: u64,
    #[validate(range(min = 1, message = "concurrency must be at least 1"))]
    pub concurrency: u32,
    #[serde(default)]
    pub max_input_mb: u32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens_default: u32,
}

fn default_max_output_tokens() -> u32 {
    2048
}

impl Limits {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }

    pub fn max_input_bytes(&self) -> Option<usize> {
        (self.max_input_mb > 0).then(|| self.max_input_mb as usize * 1024 * 1024)
    }
}

/// Where the backend is expected to point at. Opaque to the orchestrator,
/// adapters read it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendRef {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model_ref: String,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub device_hint: Option<String>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    InProcess,
    Subprocess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub mode: ExecutionMode,
    #[serde(default)]
    pub warmup_on_start: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Http,
    LogRegex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ReadySpec {
    pub kind: ProbeKind,
    #[validate(range(min = 1))]
    pub timeout_sec: u64,
    #[serde(default)]
    pub http_url: Option<String>,
    #[serde(default)]
    pub log_regex: Option<String>,
}

impl ReadySpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_launch"))]
pub struct Launch {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_launch_type", rename = "type")]
    pub launch_type: String,
    #[serde(default)]
    pub explain: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[validate]
    pub ready: ReadySpec,
}

fn default_launch_type() -> String {
    "command".to_string()
}

fn validate_launch(launch: &Launch) -> Result<(), ValidationError> {
    if !launch.enabled {
        return Ok(());
    }
    if launch.cmd.is_empty() {
        return Err(ValidationError::new("launch_cmd_empty"));
    }
    match launch.ready.kind {
        ProbeKind::Http if launch.ready.http_url.is_none() => {
            Err(ValidationError::new("ready_http_url_missing"))
        }
        ProbeKind::LogRegex => match launch.ready.log_regex.as_deref() {
            Some(pattern) if regex::Regex::new(pattern).is_ok() => Ok(()),
            Some(_) => Err(ValidationError::new("ready_log_regex_invalid")),
            None => Err(ValidationError::new("ready_log_regex_missing")),
        },
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiParamType {
    Select,
    Number,
    Slider,
    Text,
    Toggle,
}

/// One user-adjustable knob. Purely descriptive; surfaced through `/v1/models`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiParam {
    pub key: String,
    #[serde(rename = "type")]
    pub param_type: UiParamType,
    #[serde(default)]
    pub default: serde_json::Value,
    #[serde(default)]
    pub choices: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ModelSpec {
    #[validate(length(min = 1, message = "id must not be empty"))]
    pub id: String,
    pub kind: ModelKind,
    #[serde(default)]
    pub display: DisplayInfo,
    #[validate]
    pub compat: Compat,
    #[validate]
    pub api: ApiSpec,
    #[validate]
    pub limits: Limits,
    #[serde(default)]
    pub backend: BackendRef,
    pub execution: Execution,
    #[serde(default)]
    #[validate]
    pub launch: Option<Launch>,
    #[serde(default)]
    pub ui_params: Vec<UiParam>,
}

impl ModelSpec {
    /// A minimal in-process spec runnable on the current machine's CPU.
    pub fn new(id: impl Into<String>, kind: ModelKind) -> Self {
        let id = id.into();
        let endpoint = match kind {
            ModelKind::Tts => Endpoint::AudioSpeech,
            ModelKind::Stt => Endpoint::AudioTranscriptions,
            ModelKind::Embedding => Endpoint::Embeddings,
            _ => Endpoint::Responses,
        };
        let advertised = id.rsplit('/').next().unwrap_or(&id).to_string();
        Self {
            kind,
            display: DisplayInfo::default(),
            compat: Compat {
                platforms: vec![platform::current_platform()],
                acceleration: vec![Accelerator::Cpu],
                priority: 0,
                requires_ram_gb: 0,
                requires_vram_gb: 0,
                disk_gb: 0,
            },
            api: ApiSpec {
                endpoint,
                advertised_model_name: advertised,
                supports_stream: true,
            },
            limits: Limits {
                timeout_sec: 300,
                concurrency: 1,
                max_input_mb: 0,
                max_output_tokens_default: default_max_output_tokens(),
            },
            backend: BackendRef::default(),
            execution: Execution {
                mode: ExecutionMode::InProcess,
                warmup_on_start: false,
            },
            launch: None,
            ui_params: Vec::new(),
            id,
        }
    }

    pub fn with_platforms<I, S>(mut self, platforms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compat.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_acceleration(mut self, acceleration: Vec<Accelerator>) -> Self {
        self.compat.acceleration = acceleration;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.compat.priority = priority;
        self
    }

    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.limits.concurrency = concurrency;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.limits.timeout_sec = secs;
        self
    }

    pub fn with_warmup_on_start(mut self, warmup: bool) -> Self {
        self.execution.warmup_on_start = warmup;
        self
    }

    pub fn with_launch(mut self, launch: Launch) -> Self {
        self.execution.mode = ExecutionMode::Subprocess;
        self.launch = Some(launch);
        self
    }

    /// True when the orchestrator itself must start a worker process.
    pub fn requires_launch(&self) -> bool {
        self.execution.mode == ExecutionMode::Subprocess
            && self.launch.as_ref().map(|l| l.enabled).unwrap_or(false)
    }

    /// True for subprocess models hosted in a worker someone else started.
    pub fn uses_shared_worker(&self) -> bool {
        self.execution.mode == ExecutionMode::Subprocess && !self.requires_launch()
    }

    pub fn check(&self) -> anyhow::Result<()> {
        self.validate()
            .map_err(|e| anyhow::anyhow!("invalid model spec {}: {}", self.id, e))
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let spec: ModelSpec = serde_json::from_str(raw).context("failed to parse model spec")?;
        spec.check()?;
        Ok(spec)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    List(Vec<ModelSpec>),
    Wrapped { models: Vec<ModelSpec> },
}

/// Read a JSON catalog: either a bare array of specs or `{"models": [...]}`.
pub fn load_catalog_file(path: &Path) -> anyhow::Result<Vec<ModelSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read model catalog {}", path.display()))?;
    let parsed: CatalogFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse model catalog {}", path.display()))?;
    let specs = match parsed {
        CatalogFile::List(specs) => specs,
        CatalogFile::Wrapped { models } => models,
    };
    for spec in &specs {
        spec.check()?;
    }
    info!("Loaded {} model spec(s) from {}", specs.len(), path.display());
    Ok(specs)
}
