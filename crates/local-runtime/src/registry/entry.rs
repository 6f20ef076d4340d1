//! Per-model lifecycle state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};

use crate::adapter::{Instance, LoadedModel};
use crate::error::{Result, RuntimeError};
use crate::supervisor::WorkerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

/// Outcome published to everyone waiting on one load attempt.
pub(crate) type LoadOutcome = Option<Result<Instance>>;

pub(crate) enum EntryState {
    Unloaded,
    Loading(watch::Receiver<LoadOutcome>),
    Ready(Instance),
    Failed(RuntimeError),
}

impl EntryState {
    pub(crate) fn status(&self) -> LifecycleStatus {
        match self {
            EntryState::Unloaded => LifecycleStatus::Unloaded,
            EntryState::Loading(_) => LifecycleStatus::Loading,
            EntryState::Ready(_) => LifecycleStatus::Ready,
            EntryState::Failed(_) => LifecycleStatus::Failed,
        }
    }
}

pub(crate) struct RegistryEntry {
    pub(crate) model: LoadedModel,
    state: Mutex<EntryState>,
    pub(crate) slots: Arc<Semaphore>,
    pub(crate) worker: tokio::sync::Mutex<Option<WorkerHandle>>,
    worker_url: Mutex<Option<String>>,
    loads_started: AtomicUsize,
}

impl RegistryEntry {
    pub(crate) fn new(model: LoadedModel) -> Self {
        let permits = model.spec.limits.concurrency.max(1) as usize;
        Self {
            model,
            state: Mutex::new(EntryState::Unloaded),
            slots: Arc::new(Semaphore::new(permits)),
            worker: tokio::sync::Mutex::new(None),
            worker_url: Mutex::new(None),
            loads_started: AtomicUsize::new(0),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.model.spec.id
    }

    /// Held only for short, non-async sections.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn status(&self) -> LifecycleStatus {
        self.lock_state().status()
    }

    pub(crate) fn worker_url(&self) -> Option<String> {
        self.worker_url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_worker_url(&self, url: Option<String>) {
        *self
            .worker_url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = url;
    }

    pub(crate) fn note_load_started(&self) -> usize {
        self.loads_started.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn loads_started(&self) -> usize {
        self.loads_started.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        let limit = self.model.spec.limits.concurrency.max(1) as usize;
        limit.saturating_sub(self.slots.available_permits())
    }
}
