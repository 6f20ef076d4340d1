use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::backends::http_worker::DEFAULT_CHUNK_BYTES;
use crate::model_spec::Accelerator;
use crate::platform::Environment;
use crate::pool::InferencePool;
use crate::registry::{PreloadPolicy, RegistryOptions};
use crate::supervisor::ProcessSupervisor;

const ENV_PREFIX: &str = "LOCAL_RUNTIME_";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub enable_warmup: bool,
    pub platform_override: Option<String>,
    pub acceleration_override: Option<Vec<Accelerator>>,
    pub models_file: Option<PathBuf>,
    pub worker_url: Option<String>,
    pub preload: PreloadPolicy,
    pub inference_threads: usize,
    pub stop_grace_seconds: u64,
    pub probe_interval_ms: u64,
    pub enforce_resources: bool,
    pub stream_chunk_bytes: usize,
    pub enable_echo: bool,
    pub llama_bin: Option<String>,
    pub llama_model: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_host: "127.0.0.1".to_string(),
            api_port: 8765,
            enable_warmup: true,
            platform_override: None,
            acceleration_override: None,
            models_file: None,
            worker_url: None,
            preload: PreloadPolicy::None,
            inference_threads: InferencePool::default_threads(),
            stop_grace_seconds: 5,
            probe_interval_ms: 500,
            enforce_resources: false,
            stream_chunk_bytes: DEFAULT_CHUNK_BYTES,
            enable_echo: false,
            llama_bin: None,
            llama_model: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup. Keys are given without the prefix.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let inference_threads = match get("INFERENCE_THREADS").as_deref() {
            None | Some("auto") => defaults.inference_threads,
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("{}INFERENCE_THREADS is not a number: {}", ENV_PREFIX, raw))?
                .max(1),
        };

        let acceleration_override = match get("ACCELERATION") {
            None => None,
            Some(raw) => Some(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        Accelerator::parse(s)
                            .ok_or_else(|| anyhow::anyhow!("unknown accelerator in {}ACCELERATION: {}", ENV_PREFIX, s))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
        };

        let preload = match get("PRELOAD").as_deref() {
            None | Some("none") => PreloadPolicy::None,
            Some("auto") => PreloadPolicy::Auto,
            Some(raw) => PreloadPolicy::Models(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
        };

        Ok(Self {
            api_host: get("HOST").unwrap_or(defaults.api_host),
            api_port: parse_or(get("PORT"), "PORT", defaults.api_port)?,
            enable_warmup: parse_bool_or(get("ENABLE_WARMUP"), "ENABLE_WARMUP", defaults.enable_warmup)?,
            platform_override: get("PLATFORM"),
            acceleration_override,
            models_file: get("MODELS_FILE").map(PathBuf::from),
            worker_url: get("WORKER_URL"),
            preload,
            inference_threads,
            stop_grace_seconds: parse_or(get("STOP_GRACE_SECONDS"), "STOP_GRACE_SECONDS", defaults.stop_grace_seconds)?,
            probe_interval_ms: parse_or(get("PROBE_INTERVAL_MS"), "PROBE_INTERVAL_MS", defaults.probe_interval_ms)?,
            enforce_resources: parse_bool_or(
                get("ENFORCE_RESOURCES"),
                "ENFORCE_RESOURCES",
                defaults.enforce_resources,
            )?,
            stream_chunk_bytes: parse_or(get("STREAM_CHUNK_BYTES"), "STREAM_CHUNK_BYTES", defaults.stream_chunk_bytes)?
                .max(1),
            enable_echo: parse_bool_or(get("ENABLE_ECHO"), "ENABLE_ECHO", defaults.enable_echo)?,
            llama_bin: get("LLAMA_BIN"),
            llama_model: get("LLAMA_MODEL"),
        })
    }

    /// Detected environment with the platform/accelerator overrides applied.
    pub fn environment(&self) -> Environment {
        let mut env = Environment::detect();
        if let Some(platform) = &self.platform_override {
            info!("Platform overridden: {} -> {}", env.platform, platform);
            env.platform = platform.clone();
        }
        if let Some(accelerators) = &self.acceleration_override {
            info!("Accelerators overridden: {:?}", accelerators);
            env.accelerators = accelerators.clone();
        }
        env
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            enable_warmup: self.enable_warmup,
            shared_worker_url: self.worker_url.clone(),
        }
    }

    pub fn supervisor(&self) -> ProcessSupervisor {
        ProcessSupervisor::new(
            Duration::from_secs(self.stop_grace_seconds),
            Duration::from_millis(self.probe_interval_ms),
        )
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Warmup: {}", if self.enable_warmup { "enabled" } else { "disabled" });
        if let Some(platform) = &self.platform_override {
            info!("- Platform Override: {}", platform);
        }
        if let Some(accelerators) = &self.acceleration_override {
            info!("- Acceleration Override: {:?}", accelerators);
        }
        info!(
            "- Models File: {}",
            self.models_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".into())
        );
        info!("- Shared Worker: {}", self.worker_url.as_deref().unwrap_or("none"));
        info!("- Preload: {:?}", self.preload);
        info!("- Inference Threads: {}", self.inference_threads);
        info!("- Stop Grace: {}s", self.stop_grace_seconds);
        info!("- Probe Interval: {}ms", self.probe_interval_ms);
        info!("- Enforce Resources: {}", self.enforce_resources);
        info!("- Stream Chunk: {} bytes", self.stream_chunk_bytes);
        if let (Some(bin), Some(model)) = (&self.llama_bin, &self.llama_model) {
            info!("- llama-server: {} ({})", bin, model);
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.api_host, self.api_port))
    }
}

fn parse_or<T>(raw: Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid {}{}: {}", ENV_PREFIX, name, raw)),
    }
}

fn parse_bool_or(raw: Option<String>, name: &str, default: bool) -> Result<bool> {
    match raw.as_deref().map(str::to_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(anyhow::anyhow!("invalid {}{}: {}", ENV_PREFIX, name, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    // ===== Defaults =====

    #[test]
    fn test_defaults_without_environment() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.api_host, "127.0.0.1");
        assert_eq!(config.api_port, 8765);
        assert!(config.enable_warmup);
        assert!(!config.enforce_resources);
        assert_eq!(config.stop_grace_seconds, 5);
        assert_eq!(config.probe_interval_ms, 500);
        assert_eq!(config.stream_chunk_bytes, 8192);
        assert_eq!(config.preload, PreloadPolicy::None);
        assert!(config.worker_url.is_none());
        assert!(config.inference_threads >= 1);
    }

    #[test]
    fn test_api_addr_parsing() {
        let config = config_from(&[("HOST", "0.0.0.0"), ("PORT", "9000")]).unwrap();
        let addr = config.api_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
        assert_eq!(addr.port(), 9000);

        let config = config_from(&[("HOST", "not a host")]).unwrap();
        assert!(config.api_addr().is_err());
    }

    // ===== Parsing =====

    #[test]
    fn test_flags_accept_common_spellings() {
        let config = config_from(&[("ENABLE_WARMUP", "off"), ("ENFORCE_RESOURCES", "YES")]).unwrap();
        assert!(!config.enable_warmup);
        assert!(config.enforce_resources);
        assert!(config_from(&[("ENABLE_WARMUP", "maybe")]).is_err());
    }

    #[test]
    fn test_invalid_numbers_are_errors() {
        assert!(config_from(&[("PORT", "eighty")]).is_err());
        assert!(config_from(&[("INFERENCE_THREADS", "many")]).is_err());
    }

    #[test]
    fn test_inference_threads() {
        assert_eq!(config_from(&[("INFERENCE_THREADS", "3")]).unwrap().inference_threads, 3);
        assert_eq!(config_from(&[("INFERENCE_THREADS", "0")]).unwrap().inference_threads, 1);
        let auto = config_from(&[("INFERENCE_THREADS", "auto")]).unwrap();
        assert_eq!(auto.inference_threads, InferencePool::default_threads());
    }

    #[test]
    fn test_preload_policy() {
        assert_eq!(config_from(&[("PRELOAD", "auto")]).unwrap().preload, PreloadPolicy::Auto);
        assert_eq!(
            config_from(&[("PRELOAD", "local//llm/a, local//tts/b,")]).unwrap().preload,
            PreloadPolicy::Models(vec!["local//llm/a".into(), "local//tts/b".into()])
        );
    }

    #[test]
    fn test_acceleration_override() {
        let config = config_from(&[("ACCELERATION", "cpu,cuda")]).unwrap();
        assert_eq!(
            config.acceleration_override,
            Some(vec![Accelerator::Cpu, Accelerator::Cuda])
        );
        assert!(config_from(&[("ACCELERATION", "tpu")]).is_err());
    }

    #[test]
    fn test_overrides_apply_to_environment() {
        let config = config_from(&[("PLATFORM", "linux-x64"), ("ACCELERATION", "cpu")]).unwrap();
        let env = config.environment();
        assert_eq!(env.platform, "linux-x64");
        assert_eq!(env.accelerators, vec![Accelerator::Cpu]);
    }

    #[test]
    fn test_registry_options_follow_config() {
        let config = config_from(&[("ENABLE_WARMUP", "false"), ("WORKER_URL", "http://127.0.0.1:9100")]).unwrap();
        let options = config.registry_options();
        assert!(!options.enable_warmup);
        assert_eq!(options.shared_worker_url.as_deref(), Some("http://127.0.0.1:9100"));
    }

    #[test]
    fn test_blank_values_count_as_unset() {
        let config = config_from(&[("WORKER_URL", "   "), ("PORT", "")]).unwrap();
        assert!(config.worker_url.is_none());
        assert_eq!(config.api_port, 8765);
    }
}
