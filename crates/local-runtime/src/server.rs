//! Server startup: environment detection, loader, registry, then the HTTP
//! front door. Workers launched for models are stopped on the way out.

use std::time::Duration;

use tokio::signal;
use tracing::{info, warn};

use crate::{
    api::{self, AppState},
    backends,
    config::Config,
    orchestrator::Orchestrator,
    pool::InferencePool,
    registry::ModelRegistry,
};

/// Build the orchestrator described by `cfg`.
pub fn build_orchestrator(cfg: &Config) -> anyhow::Result<Orchestrator> {
    let env = cfg.environment();
    let loader = backends::build_loader(cfg, env)?;
    let eligible = loader.discover();
    info!("{} of {} model(s) eligible on this machine", eligible.len(), loader.all().len());
    for model in &eligible {
        info!("  - {} (priority {})", model.spec.id, model.spec.compat.priority);
    }

    let pool = InferencePool::new(cfg.inference_threads)?;
    let registry = ModelRegistry::new(loader, cfg.supervisor(), pool, cfg.registry_options());
    Ok(Orchestrator::new(registry))
}

pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let orchestrator = build_orchestrator(&cfg)?;
    let registry = orchestrator.registry().clone();

    // Preload in the background; requests that arrive first share the load.
    let preload = cfg.preload.clone();
    let preload_registry = registry.clone();
    tokio::spawn(async move {
        let ready = preload_registry.preload_on_start(&preload).await;
        if ready > 0 {
            info!("{} model(s) preloaded", ready);
        }
    });

    let addr = cfg.api_addr()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = build_router(AppState::new(orchestrator));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping launched workers");
    registry.shutdown().await;
    Ok(())
}

/// Routes plus middleware.
pub fn build_router(state: AppState) -> axum::Router {
    use tower_http::{
        cors::{Any, CorsLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    api::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(600)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
