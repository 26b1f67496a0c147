//! Crate-wide error type. Domain errors live next to the code they describe
//! and convert into [`Error`] via `From`.

use crate::client::QueueError;
use crate::config::ConfigError;
use crate::pipeline::PipelineError;
use crate::realtime::RealtimeError;
use crate::tracing::TracingError;
use thiserror::Error;

pub type AimqResult<T> = Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Realtime(#[from] RealtimeError),

    #[error(transparent)]
    Tracing(#[from] TracingError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
