//! Per-queue policy, captured at registration time and frozen while the
//! worker runs.

use crate::config::ConfigError;
use crate::pipeline::{Runnable, Transform};
use serde_derive::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Tunables for a single queue. Defaults match a long-running tool pipeline:
/// five-minute job timeout, one job per read, archive on success.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
#[serde(default, rename_all = "kebab-case")]
#[non_exhaustive]
pub struct QueuePolicy {
    /// Max duration a single job may run before it is abandoned.
    #[serde_as(as = "serde_with::DurationSeconds")]
    #[builder(default = DEFAULT_JOB_TIMEOUT)]
    pub timeout: Duration,

    /// Seconds a read hides messages from other readers. Defaults to
    /// `timeout`; must not be shorter than it.
    #[serde_as(as = "Option<serde_with::DurationSeconds>")]
    pub visibility_timeout: Option<Duration>,

    /// Max jobs fetched per read, and the concurrency cap for executing them.
    #[builder(default = 1)]
    pub batch_size: u32,

    /// Delete the message on success instead of archiving it.
    #[builder(default)]
    pub delete_on_finish: bool,

    /// Static tags attached to every job read from the queue.
    #[builder(default, into)]
    pub tags: Vec<String>,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A queue bound to its runnable and policy.
#[derive(Clone)]
pub struct QueueDescriptor {
    name: String,
    runnable: Transform,
    policy: QueuePolicy,
}

impl QueueDescriptor {
    pub(crate) fn new(
        name: impl Into<String>,
        runnable: Transform,
        policy: QueuePolicy,
    ) -> Result<Self, ConfigError> {
        let name = name.into();

        if policy.batch_size < 1 {
            return Err(ConfigError::InvalidPolicy {
                queue: name,
                reason: "batch-size must be at least 1".to_owned(),
            });
        }
        if policy.timeout.is_zero() {
            return Err(ConfigError::InvalidPolicy {
                queue: name,
                reason: "timeout must be positive".to_owned(),
            });
        }

        let visibility_timeout = policy.visibility_timeout.unwrap_or(policy.timeout);
        if visibility_timeout < policy.timeout {
            return Err(ConfigError::InvalidPolicy {
                queue: name,
                reason: "visibility-timeout must not be shorter than timeout".to_owned(),
            });
        }

        Ok(Self {
            name,
            runnable,
            policy: QueuePolicy {
                visibility_timeout: Some(visibility_timeout),
                ..policy
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub(crate) fn runnable(&self) -> &Transform {
        &self.runnable
    }

    /// The visibility timeout as whole seconds for the read RPC.
    pub(crate) fn visibility_timeout_secs(&self) -> u32 {
        let visibility_timeout = self
            .policy
            .visibility_timeout
            .unwrap_or(self.policy.timeout);
        u32::try_from(visibility_timeout.as_secs()).unwrap_or(u32::MAX)
    }
}

impl std::fmt::Debug for QueueDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDescriptor")
            .field("name", &self.name)
            .field("runnable", &self.runnable.name())
            .field("policy", &self.policy)
            .finish()
    }
}
