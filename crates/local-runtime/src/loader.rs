//! Static table of `(ModelSpec, BackendAdapter)` pairs, filtered against
//! the machine we are running on.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::adapter::{BackendAdapter, LoadedModel};
use crate::error::{Result, RuntimeError};
use crate::model_spec::{ModelKind, ModelSpec};
use crate::platform::Environment;

pub struct LoaderBuilder {
    env: Environment,
    pending: Vec<(ModelSpec, Arc<dyn BackendAdapter>)>,
    enforce_resources: bool,
}

impl LoaderBuilder {
    pub fn register(mut self, spec: ModelSpec, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.pending.push((spec, adapter));
        self
    }

    /// Also reject specs whose declared RAM/VRAM/disk needs exceed what
    /// this machine has.
    pub fn enforce_resources(mut self, enforce: bool) -> Self {
        self.enforce_resources = enforce;
        self
    }

    pub fn build(self) -> anyhow::Result<Loader> {
        let mut seen = HashSet::new();
        let mut models = Vec::with_capacity(self.pending.len());
        for (order, (spec, adapter)) in self.pending.into_iter().enumerate() {
            spec.check()?;
            if !seen.insert(spec.id.clone()) {
                anyhow::bail!("model id registered twice: {}", spec.id);
            }
            models.push(LoadedModel {
                spec: Arc::new(spec),
                adapter,
                order,
            });
        }
        info!("Loader registered {} model(s) for {}", models.len(), self.env.platform);
        Ok(Loader {
            env: self.env,
            models,
            enforce_resources: self.enforce_resources,
        })
    }
}

/// Immutable after `build`.
pub struct Loader {
    env: Environment,
    models: Vec<LoadedModel>,
    enforce_resources: bool,
}

impl Loader {
    pub fn builder(env: Environment) -> LoaderBuilder {
        LoaderBuilder {
            env,
            pending: Vec::new(),
            enforce_resources: false,
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Every registered model, eligible or not, in registration order.
    pub fn all(&self) -> &[LoadedModel] {
        &self.models
    }

    /// Eligible models, highest priority first. Equal priorities keep
    /// registration order.
    pub fn discover(&self) -> Vec<LoadedModel> {
        let mut eligible: Vec<LoadedModel> = self
            .models
            .iter()
            .filter(|m| match self.check_compat(&m.spec) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Skipping {}: {}", m.spec.id, e);
                    false
                }
            })
            .cloned()
            .collect();
        // sort_by_key is stable
        eligible.sort_by_key(|m| Reverse(m.spec.compat.priority));
        eligible
    }

    /// Exact id lookup. Does not filter on eligibility.
    pub fn resolve(&self, id: &str) -> Result<LoadedModel> {
        self.models
            .iter()
            .find(|m| m.spec.id == id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    /// Lookup by id or by advertised model name. Advertised names only
    /// match eligible models, best priority first.
    pub fn resolve_name(&self, name: &str) -> Result<LoadedModel> {
        if let Ok(model) = self.resolve(name) {
            return Ok(model);
        }
        self.discover()
            .into_iter()
            .find(|m| m.spec.api.advertised_model_name == name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    /// Highest ranked eligible model of a kind.
    pub fn default_model(&self, kind: ModelKind) -> Option<LoadedModel> {
        self.discover().into_iter().find(|m| m.spec.kind == kind)
    }

    /// `Ok` when `spec` can run here, otherwise the first missing requirement.
    pub fn check_compat(&self, spec: &ModelSpec) -> Result<()> {
        let incompatible = |missing: String| RuntimeError::IncompatibleEnvironment {
            model_id: spec.id.clone(),
            missing,
        };

        if !spec.compat.platforms.iter().any(|p| p == &self.env.platform) {
            return Err(incompatible(format!(
                "platform {} (supports {})",
                self.env.platform,
                spec.compat.platforms.join(", ")
            )));
        }

        if !spec
            .compat
            .acceleration
            .iter()
            .any(|a| self.env.has_accelerator(*a))
        {
            let wanted: Vec<String> = spec.compat.acceleration.iter().map(|a| a.to_string()).collect();
            return Err(incompatible(format!("accelerator, one of [{}]", wanted.join(", "))));
        }

        if self.enforce_resources {
            let res = &self.env.resources;
            let ram = u64::from(spec.compat.requires_ram_gb);
            if ram > res.total_ram_gb {
                return Err(incompatible(format!(
                    "{}GB RAM (have {}GB)",
                    ram, res.total_ram_gb
                )));
            }
            let disk = u64::from(spec.compat.disk_gb);
            if disk > res.available_disk_gb {
                return Err(incompatible(format!(
                    "{}GB free disk (have {}GB)",
                    disk, res.available_disk_gb
                )));
            }
            // No visible GPU means VRAM cannot be measured; skip it then.
            let vram = u64::from(spec.compat.requires_vram_gb);
            if let Some(have) = res.vram_gb {
                if vram > have {
                    return Err(incompatible(format!("{}GB VRAM (have {}GB)", vram, have)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Instance, RunOutput, RunRequest};
    use crate::context::RunContext;
    use crate::model_spec::Accelerator;
    use crate::platform::Resources;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl BackendAdapter for Noop {
        async fn load(&self, _ctx: &RunContext) -> anyhow::Result<Instance> {
            Ok(Instance::new(()))
        }

        async fn run(&self, _request: &RunRequest, _ctx: &RunContext) -> anyhow::Result<RunOutput> {
            Ok(RunOutput::text("ok"))
        }
    }

    fn spec(id: &str, priority: i32) -> ModelSpec {
        ModelSpec::new(id, ModelKind::Llm)
            .with_platforms(["linux-x64"])
            .with_priority(priority)
    }

    fn loader(specs: Vec<ModelSpec>) -> Loader {
        let env = Environment::fixed("linux-x64", vec![Accelerator::Cpu]);
        specs
            .into_iter()
            .fold(Loader::builder(env), |b, s| b.register(s, Arc::new(Noop)))
            .build()
            .unwrap()
    }

    #[test]
    fn test_discover_orders_by_priority_then_registration() {
        let loader = loader(vec![
            spec("a", 10),
            spec("b", 100),
            spec("c", 10),
            spec("d", 100),
        ]);
        let ids: Vec<String> = loader.discover().iter().map(|m| m.spec.id.clone()).collect();
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn test_ineligible_specs_are_never_discovered() {
        let loader = loader(vec![
            spec("mac-only", 1000).with_platforms(["darwin-arm64"]),
            spec("cuda-only", 1000).with_acceleration(vec![Accelerator::Cuda]),
            spec("cpu", 1),
        ]);
        let discovered = loader.discover();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].spec.id, "cpu");
        assert_eq!(loader.default_model(ModelKind::Llm).unwrap().spec.id, "cpu");
        assert!(loader.default_model(ModelKind::Tts).is_none());
    }

    #[test]
    fn test_resolve_bypasses_filter_but_check_names_requirement() {
        let loader = loader(vec![spec("cuda-only", 1).with_acceleration(vec![Accelerator::Cuda])]);
        let model = loader.resolve("cuda-only").unwrap();
        match loader.check_compat(&model.spec) {
            Err(RuntimeError::IncompatibleEnvironment { model_id, missing }) => {
                assert_eq!(model_id, "cuda-only");
                assert!(missing.contains("cuda"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(
            loader.resolve("nope").unwrap_err(),
            RuntimeError::NotFound("nope".into())
        );
    }

    #[test]
    fn test_resolve_name_uses_advertised_alias() {
        let loader = loader(vec![spec("local//llm/qwen3-hf", 1)]);
        assert_eq!(loader.resolve_name("qwen3-hf").unwrap().spec.id, "local//llm/qwen3-hf");
        assert!(loader.resolve_name("other").is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let env = Environment::fixed("linux-x64", vec![Accelerator::Cpu]);
        let result = Loader::builder(env)
            .register(spec("a", 1), Arc::new(Noop))
            .register(spec("a", 2), Arc::new(Noop))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_resource_enforcement_is_opt_in() {
        let mut hungry = spec("hungry", 1);
        hungry.compat.requires_ram_gb = 64;
        let env = Environment::fixed("linux-x64", vec![Accelerator::Cpu]).with_resources(Resources {
            total_ram_gb: 16,
            available_disk_gb: 100,
            vram_gb: None,
            cpu_cores: 8,
        });

        let relaxed = Loader::builder(env.clone())
            .register(hungry.clone(), Arc::new(Noop))
            .build()
            .unwrap();
        assert_eq!(relaxed.discover().len(), 1);

        let strict = Loader::builder(env)
            .register(hungry, Arc::new(Noop))
            .enforce_resources(true)
            .build()
            .unwrap();
        assert!(strict.discover().is_empty());
        let err = strict.check_compat(&strict.all()[0].spec).unwrap_err();
        assert!(err.to_string().contains("64GB RAM"));
    }
}
