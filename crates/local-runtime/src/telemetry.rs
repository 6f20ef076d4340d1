use tracing_subscriber::{fmt, EnvFilter};

/// Directive used when `RUST_LOG` is unset. Worker output is logged at
/// `debug` under this crate's target, so raise it to see it.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Install the global fmt subscriber. Returns false if one was already set,
/// which happens when tests or an embedding host got there first.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
