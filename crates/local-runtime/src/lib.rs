pub mod adapter;
pub mod backends;
pub mod config;
pub mod context;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod model_spec;
pub mod orchestrator;
pub mod platform;
pub mod pool;
pub mod registry;
pub mod stream;
pub mod supervisor;
pub mod telemetry;

#[cfg(feature = "cli")]
pub mod api;
#[cfg(feature = "cli")]
pub mod server;

// Public API exports
pub use adapter::{BackendAdapter, Content, Fragment, FragmentStream, Instance, LoadedModel, RunOutput, RunRequest};
pub use config::Config;
pub use context::RunContext;
pub use error::{Result, RuntimeError};
pub use loader::Loader;
pub use model_spec::{ModelKind, ModelSpec};
pub use orchestrator::{GuardedEvents, Orchestrator, RunResult};
pub use platform::Environment;
pub use pool::{InferencePool, ScopedPool};
pub use registry::{LifecycleStatus, ModelRegistry, PreloadPolicy, RegistryOptions, SlotGuard, SlotLease};
pub use stream::{ResponseObject, StreamAdapter, StreamEvent};
pub use supervisor::{ProcessSupervisor, WorkerHandle};

#[cfg(feature = "cli")]
pub use server::run_server;
