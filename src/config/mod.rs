//! Environment-driven configuration.
//!
//! The worker recognizes exactly the following variables (a `.env` file is
//! loaded first if present): `SUPABASE_URL`, `SUPABASE_KEY`, `WORKER_NAME`,
//! `WORKER_LOG_LEVEL`, and `WORKER_IDLE_WAIT`. Anything invalid or missing
//! is fatal at startup.

use config::Config;
use dotenvy::dotenv;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use validator::Validate;

pub const DEFAULT_WORKER_NAME: &str = "peon";
pub const DEFAULT_IDLE_WAIT_SECONDS: f64 = 10.0;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("unable to load configuration from the environment: {0}")]
    Environment(#[from] config::ConfigError),

    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),

    #[error("queue `{0}` is already registered")]
    AlreadyRegistered(String),

    #[error("invalid policy for queue `{queue}`: {reason}")]
    InvalidPolicy { queue: String, reason: String },

    #[error("the worker is already running")]
    AlreadyRunning,

    #[error("unable to initialize the rpc client: {0}")]
    RpcClient(String),
}

/// Runtime configuration, deserialized from the environment.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[non_exhaustive]
pub struct AimqConfig {
    /// Base URL of the database HTTP API.
    pub supabase_url: Url,

    /// Service credential sent with every RPC and realtime connection.
    #[validate(length(min = 1))]
    pub supabase_key: String,

    /// Diagnostic label attached to this worker's lifecycle logs.
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    /// Default log level for the tracing filter.
    #[serde(default)]
    pub worker_log_level: LogLevel,

    /// Seconds a queue fiber waits in idle before polling without a wake-up.
    #[serde(default = "default_idle_wait")]
    #[validate(range(min = 0.0))]
    pub worker_idle_wait: f64,
}

impl AimqConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let config: AimqConfig = Config::builder()
            .add_source(config::Environment::default())
            .build()?
            .try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_secs_f64(self.worker_idle_wait)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_level(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

fn default_worker_name() -> String {
    DEFAULT_WORKER_NAME.to_owned()
}

fn default_idle_wait() -> f64 {
    DEFAULT_IDLE_WAIT_SECONDS
}
