//! One lazily created instance per model id, and the slots that gate it.
//!
//! Entries are created on the first `ensure_instance`/`acquire` for an id
//! that resolves and is compatible. Loads run on a detached task so a
//! cancelled first caller cannot strand the other waiters.

mod entry;
mod slot;

pub use entry::LifecycleStatus;
pub use slot::{Guarded, SlotGuard, SlotLease};

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

use crate::adapter::Instance;
use crate::context::RunContext;
use crate::error::{Result, RuntimeError};
use crate::loader::Loader;
use crate::metrics;
use crate::model_spec::ModelKind;
use crate::pool::InferencePool;
use crate::supervisor::ProcessSupervisor;

pub(crate) use entry::RegistryEntry;
use entry::{EntryState, LoadOutcome};

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Registry-wide warmup switch. Warmup also needs the model's
    /// `warmup_on_start`.
    pub enable_warmup: bool,
    /// Base URL of the shared worker hosting subprocess models that are
    /// not launched by us.
    pub shared_worker_url: Option<String>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            enable_warmup: true,
            shared_worker_url: None,
        }
    }
}

/// Which models to bring up before serving.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PreloadPolicy {
    #[default]
    None,
    /// Every eligible model with `warmup_on_start`.
    Auto,
    Models(Vec<String>),
}

/// One row of `snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub id: String,
    pub kind: ModelKind,
    pub status: LifecycleStatus,
    pub concurrency: u32,
    pub in_flight: usize,
    pub loads: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct RegistryInner {
    loader: Loader,
    entries: DashMap<String, Arc<RegistryEntry>>,
    supervisor: ProcessSupervisor,
    pool: InferencePool,
    options: RegistryOptions,
}

/// Cheap-to-clone handle; all clones share the same entries.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(
        loader: Loader,
        supervisor: ProcessSupervisor,
        pool: InferencePool,
        options: RegistryOptions,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                loader,
                entries: DashMap::new(),
                supervisor,
                pool,
                options,
            }),
        }
    }

    pub fn loader(&self) -> &Loader {
        &self.inner.loader
    }

    pub fn pool(&self) -> &InferencePool {
        &self.inner.pool
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    /// Whether an entry exists for `id`. Lookups that fail never create one.
    pub fn is_tracked(&self, id: &str) -> bool {
        self.inner.entries.contains_key(id)
    }

    pub fn status(&self, id: &str) -> Result<LifecycleStatus> {
        if let Some(entry) = self.inner.entries.get(id) {
            return Ok(entry.status());
        }
        self.inner.loader.resolve(id).map(|_| LifecycleStatus::Unloaded)
    }

    /// How many times `load` has been started for `id`.
    pub fn load_count(&self, id: &str) -> usize {
        self.inner
            .entries
            .get(id)
            .map(|e| e.loads_started())
            .unwrap_or(0)
    }

    /// Eligible models, in discovery order, with their lifecycle state.
    pub fn snapshot(&self) -> Vec<ModelStatus> {
        self.inner
            .loader
            .discover()
            .into_iter()
            .map(|model| {
                let spec = &model.spec;
                let mut row = ModelStatus {
                    id: spec.id.clone(),
                    kind: spec.kind,
                    status: LifecycleStatus::Unloaded,
                    concurrency: spec.limits.concurrency,
                    in_flight: 0,
                    loads: 0,
                    worker_url: None,
                    error: None,
                };
                if let Some(entry) = self.inner.entries.get(&spec.id) {
                    let state = entry.lock_state();
                    row.status = state.status();
                    if let EntryState::Failed(e) = &*state {
                        row.error = Some(e.to_string());
                    }
                    drop(state);
                    row.in_flight = entry.in_flight();
                    row.loads = entry.loads_started();
                    row.worker_url = entry.worker_url();
                }
                row
            })
            .collect()
    }

    /// Look up (or create) the entry for `id`. Unknown and incompatible ids
    /// leave no trace.
    pub(crate) fn entry(&self, id: &str) -> Result<Arc<RegistryEntry>> {
        if let Some(entry) = self.inner.entries.get(id) {
            return Ok(entry.clone());
        }
        let model = self.inner.loader.resolve(id)?;
        self.inner.loader.check_compat(&model.spec)?;
        let entry = self
            .inner
            .entries
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RegistryEntry::new(model)))
            .clone();
        Ok(entry)
    }

    /// Return the instance for `id`, loading it first if needed.
    ///
    /// Concurrent callers share a single load attempt and all observe its
    /// outcome. A failed attempt is kept until the next call retries it.
    pub async fn ensure_instance(&self, id: &str, ctx: &RunContext) -> Result<Instance> {
        let entry = self.entry(id)?;
        self.ensure_entry(&entry, ctx).await
    }

    pub(crate) async fn ensure_entry(&self, entry: &Arc<RegistryEntry>, ctx: &RunContext) -> Result<Instance> {
        let mut rx = {
            let mut state = entry.lock_state();
            match &*state {
                EntryState::Ready(instance) => return Ok(instance.clone()),
                EntryState::Loading(rx) => rx.clone(),
                EntryState::Unloaded | EntryState::Failed(_) => {
                    let (tx, rx) = watch::channel(None);
                    *state = EntryState::Loading(rx.clone());
                    self.spawn_load(entry.clone(), ctx.without_lease(), tx);
                    rx
                }
            }
        };
        wait_for_outcome(entry, &mut rx).await
    }

    fn spawn_load(&self, entry: Arc<RegistryEntry>, ctx: RunContext, tx: watch::Sender<LoadOutcome>) {
        let registry = self.clone();
        let span = ctx.span().clone();
        tokio::spawn(
            async move {
                let outcome = registry.load_entry(&entry, &ctx).await;
                {
                    let mut state = entry.lock_state();
                    *state = match &outcome {
                        Ok(instance) => EntryState::Ready(instance.clone()),
                        Err(e) => EntryState::Failed(e.clone()),
                    };
                }
                // Nobody waiting is fine: the state above is the record.
                let _ = tx.send(Some(outcome));
            }
            .instrument(span),
        );
    }

    async fn load_entry(&self, entry: &RegistryEntry, ctx: &RunContext) -> Result<Instance> {
        let model = &entry.model;
        let spec = &model.spec;
        let attempt = entry.note_load_started();
        let started = Instant::now();
        info!(model_id = %spec.id, attempt, "Loading model");

        let worker_url = if spec.requires_launch() {
            let handle = self.inner.supervisor.launch(spec).await?;
            let url = handle.base_url();
            *entry.worker.lock().await = Some(handle);
            Some(url)
        } else if spec.uses_shared_worker() {
            self.inner.options.shared_worker_url.clone()
        } else {
            None
        };
        entry.set_worker_url(worker_url.clone());

        let scoped = ctx.scoped(model, worker_url);
        let warmup = self.inner.options.enable_warmup && spec.execution.warmup_on_start;
        let result = async {
            let instance = model
                .adapter
                .load(&scoped)
                .await
                .map_err(|e| RuntimeError::from_load_failure(&spec.id, e))?;
            if warmup {
                info!(model_id = %spec.id, "Warming up model");
                model
                    .adapter
                    .warmup(&instance, &scoped)
                    .await
                    .map_err(|e| RuntimeError::from_load_failure(&spec.id, e))?;
            }
            Ok::<_, RuntimeError>(instance)
        }
        .instrument(scoped.span().clone())
        .await;

        match result {
            Ok(instance) => {
                let elapsed = started.elapsed();
                metrics::observe_load(&spec.id, elapsed.as_secs_f64());
                info!(
                    model_id = %spec.id,
                    duration_ms = elapsed.as_millis() as u64,
                    warmup,
                    "Model ready"
                );
                Ok(instance)
            }
            Err(e) => {
                error!(model_id = %spec.id, "Model failed to load: {}", e);
                self.stop_worker(entry).await;
                Err(e)
            }
        }
    }

    async fn stop_worker(&self, entry: &RegistryEntry) {
        let handle = entry.worker.lock().await.take();
        if let Some(handle) = handle {
            self.inner.supervisor.stop(handle).await;
        }
        entry.set_worker_url(None);
    }

    /// Wait for a free slot on `id`, at most `limits.timeout_sec`.
    pub async fn acquire(&self, id: &str) -> Result<SlotGuard> {
        let entry = self.entry(id)?;
        acquire_slot(&entry).await
    }

    /// Load (and maybe warm up) `id` ahead of traffic. `progress` sees each
    /// lifecycle transition.
    pub async fn preload<F>(&self, id: &str, progress: F) -> bool
    where
        F: Fn(&str, LifecycleStatus) + Send + Sync,
    {
        let ctx = RunContext::new(self.clone(), format!("preload_{}", uuid::Uuid::new_v4().simple()));
        progress(id, LifecycleStatus::Loading);
        match self.ensure_instance(id, &ctx).await {
            Ok(_) => {
                progress(id, LifecycleStatus::Ready);
                true
            }
            Err(e) => {
                warn!("Preload of {} failed: {}", id, e);
                progress(id, LifecycleStatus::Failed);
                false
            }
        }
    }

    /// Preload according to `policy`, models in parallel. Returns how many
    /// came up.
    pub async fn preload_on_start(&self, policy: &PreloadPolicy) -> usize {
        let ids: Vec<String> = match policy {
            PreloadPolicy::None => return 0,
            PreloadPolicy::Auto => self
                .inner
                .loader
                .discover()
                .into_iter()
                .filter(|m| m.spec.execution.warmup_on_start)
                .map(|m| m.spec.id.clone())
                .collect(),
            PreloadPolicy::Models(ids) => ids.clone(),
        };
        if ids.is_empty() {
            return 0;
        }
        info!("Preloading {} model(s)", ids.len());
        let results = join_all(ids.iter().map(|id| {
            self.preload(id, |id, status| info!(model_id = %id, ?status, "Preload progress"))
        }))
        .await;
        results.into_iter().filter(|ok| *ok).count()
    }

    /// Drop the instance for `id` and stop its worker, if any. The next
    /// request loads it again. Returns false when there was nothing loaded.
    pub async fn evict(&self, id: &str) -> Result<bool> {
        let entry = match self.inner.entries.get(id) {
            Some(entry) => entry.clone(),
            None => {
                self.inner.loader.resolve(id)?;
                return Ok(false);
            }
        };

        let loading = match &*entry.lock_state() {
            EntryState::Loading(rx) => Some(rx.clone()),
            _ => None,
        };
        if let Some(mut rx) = loading {
            // Let the in-flight load land first so it cannot overwrite the eviction.
            let _ = wait_for_outcome(&entry, &mut rx).await;
        }

        let previous = std::mem::replace(&mut *entry.lock_state(), EntryState::Unloaded);
        self.stop_worker(&entry).await;
        let evicted = matches!(previous, EntryState::Ready(_));
        if evicted {
            info!(model_id = %id, "Model evicted");
        }
        Ok(evicted)
    }

    /// Stop every launched worker and forget every instance.
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<RegistryEntry>> = self.inner.entries.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            *entry.lock_state() = EntryState::Unloaded;
            self.stop_worker(&entry).await;
        }
        info!("Registry shut down");
    }
}

async fn wait_for_outcome(entry: &RegistryEntry, rx: &mut watch::Receiver<LoadOutcome>) -> Result<Instance> {
    let outcome = match rx.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => None,
    };
    match outcome {
        Some(result) => result,
        None => {
            // The load task died without reporting (it panicked).
            let err = RuntimeError::load(entry.id(), "load task ended without a result");
            let mut state = entry.lock_state();
            if matches!(&*state, EntryState::Loading(_)) {
                *state = EntryState::Failed(err.clone());
            }
            Err(err)
        }
    }
}

pub(crate) async fn acquire_slot(entry: &RegistryEntry) -> Result<SlotGuard> {
    let id = entry.id();
    let limit = entry.model.spec.limits.timeout();
    let started = Instant::now();
    match tokio::time::timeout(limit, entry.slots.clone().acquire_owned()).await {
        Ok(Ok(permit)) => {
            metrics::observe_slot_wait(id, started.elapsed().as_secs_f64());
            Ok(SlotGuard::new(id, permit))
        }
        Ok(Err(_)) => Err(RuntimeError::load(id, "concurrency slots are closed")),
        Err(_) => {
            warn!(model_id = %id, "No concurrency slot free after {:?}", limit);
            Err(RuntimeError::Busy {
                model_id: id.to_string(),
                waited: started.elapsed(),
            })
        }
    }
}
