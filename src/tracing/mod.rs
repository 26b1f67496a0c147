//! Structured logging setup.

use crate::config::AimqConfig;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TracingError {
    #[error(transparent)]
    Filter(#[from] tracing_subscriber::filter::FromEnvError),

    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Initialize the global subscriber: a fmt layer filtered by
/// `WORKER_LOG_LEVEL` (overridable per-target through `RUST_LOG`).
pub fn init_tracing(config: &AimqConfig) -> Result<(), TracingError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.worker_log_level.as_level().into())
        .from_env()?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}
