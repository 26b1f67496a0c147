//! The worker supervisor: registration surface, queue scheduling fibers,
//! and graceful shutdown.
//!
//! One fiber per registered queue alternates between waiting (for a realtime
//! wake-up, the idle timer, or shutdown) and reading a batch of jobs for the
//! queue processor. The worker owns the shared [`QueueClient`] and the single
//! realtime subscription; nothing is process-global.

use crate::client::{DEFAULT_CHANNEL, DEFAULT_EVENT, QueueClient, QueueErrorKind, RetryPolicy};
use crate::config::{AimqConfig, ConfigError};
use crate::error::AimqResult;
use crate::pipeline::{PipelineError, Runnable, Transform, from_fn};
use crate::realtime::RealtimeListener;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod descriptor;
pub mod processor;

pub use descriptor::{QueueDescriptor, QueuePolicy};
pub use processor::{QueueCounters, QueueStats};

use processor::QueueProcessor;

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Builds a [`Worker`]: queues are registered here, then frozen when the
/// worker is built.
#[derive(Debug)]
pub struct WorkerBuilder {
    config: AimqConfig,
    grace: Duration,
    channel: String,
    event: String,
    descriptors: BTreeMap<String, QueueDescriptor>,
}

impl WorkerBuilder {
    fn new(config: AimqConfig) -> Self {
        Self {
            config,
            grace: DEFAULT_SHUTDOWN_GRACE,
            channel: DEFAULT_CHANNEL.to_owned(),
            event: DEFAULT_EVENT.to_owned(),
            descriptors: BTreeMap::new(),
        }
    }

    /// How long `stop()` waits for in-flight work before aborting it.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Broadcast channel the realtime subscription joins.
    pub fn realtime_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Broadcast event name that triggers wake-ups.
    pub fn realtime_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    /// Bind a runnable to a queue with the given policy. Registering the same
    /// queue twice is a configuration error.
    pub fn register(
        mut self,
        queue: impl Into<String>,
        runnable: impl Runnable + 'static,
        policy: QueuePolicy,
    ) -> Result<Self, ConfigError> {
        let queue = queue.into();
        if self.descriptors.contains_key(&queue) {
            return Err(ConfigError::AlreadyRegistered(queue));
        }

        let descriptor = QueueDescriptor::new(&queue, Transform::new(runnable), policy)?;
        debug!(worker.queue.name = %queue, "Registered queue");
        self.descriptors.insert(queue, descriptor);
        Ok(self)
    }

    /// Sugar over [`register`](Self::register) that lifts a plain async
    /// function into a runnable and applies the default policy.
    pub fn task<F, Fut>(self, queue: impl Into<String>, func: F) -> Result<Self, ConfigError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, PipelineError>> + Send + 'static,
    {
        let queue = queue.into();
        let runnable = from_fn(queue.clone(), func);
        self.register(queue, runnable, QueuePolicy::default())
    }

    pub fn build(self) -> Result<Worker, ConfigError> {
        let client = QueueClient::new(&self.config)?;
        let wakeups: BTreeMap<String, Arc<Notify>> = self
            .descriptors
            .keys()
            .map(|queue| (queue.clone(), Arc::new(Notify::new())))
            .collect();
        let counters: BTreeMap<String, Arc<QueueCounters>> = self
            .descriptors
            .keys()
            .map(|queue| (queue.clone(), Arc::new(QueueCounters::default())))
            .collect();

        Ok(Worker {
            config: self.config,
            client,
            grace: self.grace,
            channel: self.channel,
            event: self.event,
            descriptors: self.descriptors,
            wakeups,
            counters,
            state: Mutex::new(SupervisorState::Stopped),
        })
    }
}

enum SupervisorState {
    Stopped,
    Running {
        cancellation: CancellationToken,
        tasks: JoinSet<()>,
    },
}

/// Process-level supervisor of all queue processors.
pub struct Worker {
    config: AimqConfig,
    client: QueueClient,
    grace: Duration,
    channel: String,
    event: String,
    descriptors: BTreeMap<String, QueueDescriptor>,
    wakeups: BTreeMap<String, Arc<Notify>>,
    counters: BTreeMap<String, Arc<QueueCounters>>,
    state: Mutex<SupervisorState>,
}

impl Worker {
    pub fn builder(config: AimqConfig) -> WorkerBuilder {
        WorkerBuilder::new(config)
    }

    pub fn config(&self) -> &AimqConfig {
        &self.config
    }

    pub fn client(&self) -> &QueueClient {
        &self.client
    }

    pub fn queue_names(&self) -> Vec<&str> {
        self.descriptors.keys().map(String::as_str).collect()
    }

    /// Point-in-time execution counters for every registered queue.
    pub fn stats(&self) -> BTreeMap<String, QueueStats> {
        self.counters
            .iter()
            .map(|(queue, counters)| (queue.clone(), counters.snapshot()))
            .collect()
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, SupervisorState::Running { .. })
    }

    /// Enqueue a payload on a queue, visible after `delay` seconds.
    pub async fn send(&self, queue: &str, payload: &Value, delay: u64) -> AimqResult<i64> {
        Ok(self.client.send(queue, payload, delay).await?)
    }

    /// Enqueue a batch atomically; ids align positionally with the payloads.
    pub async fn send_batch(
        &self,
        queue: &str,
        payloads: &[Value],
        delay: u64,
    ) -> AimqResult<Vec<i64>> {
        Ok(self.client.send_batch(queue, payloads, delay).await?)
    }

    /// Verify every registered queue exists (creating missing ones with
    /// realtime enabled), then spawn the realtime subscription and one
    /// scheduling fiber per queue.
    pub async fn start(&self) -> AimqResult<()> {
        let mut state = self.state.lock().await;
        if matches!(*state, SupervisorState::Running { .. }) {
            return Err(ConfigError::AlreadyRunning.into());
        }

        info!(worker.name = %self.config.worker_name, "Worker starting");
        self.prepare_queues().await?;

        let cancellation = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let listener = RealtimeListener::new(
            &self.config,
            self.channel.clone(),
            self.event.clone(),
            self.wakeups.clone(),
        )?;
        tasks.spawn(listener.run(cancellation.child_token()));

        for descriptor in self.descriptors.values() {
            let fiber = QueueFiber::new(self, descriptor.clone());
            tasks.spawn(fiber.run(cancellation.child_token()));
        }

        *state = SupervisorState::Running {
            cancellation,
            tasks,
        };
        info!(
            worker.name = %self.config.worker_name,
            worker.queues = self.descriptors.len(),
            "Worker running"
        );
        Ok(())
    }

    /// Signal cancellation to every fiber and wait up to the grace deadline
    /// for in-flight jobs to finalize, then abort whatever remains.
    pub async fn stop(&self) -> AimqResult<()> {
        let mut state = self.state.lock().await;
        let SupervisorState::Running {
            cancellation,
            mut tasks,
        } = std::mem::replace(&mut *state, SupervisorState::Stopped)
        else {
            debug!("Worker is not running");
            return Ok(());
        };

        info!(worker.name = %self.config.worker_name, "Worker stopping");
        cancellation.cancel();

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.grace, drain).await.is_err() {
            warn!(
                worker.grace_secs = self.grace.as_secs(),
                "Grace deadline exceeded, aborting remaining tasks"
            );
            tasks.shutdown().await;
        }

        for (queue, counters) in &self.counters {
            let stats = counters.snapshot();
            info!(
                worker.queue.name = %queue,
                jobs.succeeded = stats.succeeded,
                jobs.failed = stats.failed,
                jobs.timed_out = stats.timed_out,
                "Queue summary"
            );
        }
        info!(worker.name = %self.config.worker_name, "Worker stopped");
        Ok(())
    }

    /// Start, then run until SIGINT, then shut down gracefully.
    pub async fn run(&self) -> AimqResult<()> {
        self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        self.stop().await
    }

    async fn prepare_queues(&self) -> AimqResult<()> {
        let existing: BTreeMap<String, bool> = self
            .client
            .list_queues()
            .await?
            .into_iter()
            .map(|info| (info.queue_name, info.realtime_enabled))
            .collect();

        for queue in self.descriptors.keys() {
            match existing.get(queue) {
                None => {
                    self.client
                        .create_queue(queue, true, &self.channel, &self.event)
                        .await?;
                    info!(worker.queue.name = %queue, "Created missing queue");
                }
                Some(false) => {
                    self.client
                        .enable_queue_realtime(queue, &self.channel, &self.event)
                        .await?;
                    info!(worker.queue.name = %queue, "Enabled realtime notifications");
                }
                Some(true) => {}
            }
        }
        Ok(())
    }
}

/// The per-queue scheduling loop: wait in idle, fetch a batch, process it,
/// repeat.
struct QueueFiber {
    descriptor: QueueDescriptor,
    processor: QueueProcessor,
    client: QueueClient,
    wakeup: Arc<Notify>,
    counters: Arc<QueueCounters>,
    idle_wait: Duration,
    channel: String,
    event: String,
    backoff: RetryPolicy,
}

impl QueueFiber {
    fn new(worker: &Worker, descriptor: QueueDescriptor) -> Self {
        let queue = descriptor.name();
        let counters = worker
            .counters
            .get(queue)
            .cloned()
            .unwrap_or_default();
        let wakeup = worker.wakeups.get(queue).cloned().unwrap_or_default();

        Self {
            processor: QueueProcessor::new(
                descriptor.clone(),
                worker.client.clone(),
                counters.clone(),
            ),
            descriptor,
            client: worker.client.clone(),
            wakeup,
            counters,
            idle_wait: worker.config.idle_wait(),
            channel: worker.channel.clone(),
            event: worker.event.clone(),
            backoff: RetryPolicy::default(),
        }
    }

    async fn run(self, cancellation: CancellationToken) {
        let queue = self.descriptor.name().to_owned();
        info!(worker.queue.name = %queue, "Queue fiber started");

        let mut error_streak: u32 = 0;
        loop {
            tokio::select! {
                // `biased` ensures the shutdown signal is polled first
                biased;

                _ = cancellation.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = sleep(self.idle_wait) => {}
            }

            let batch = self
                .client
                .read(
                    &queue,
                    self.descriptor.visibility_timeout_secs(),
                    self.descriptor.policy().batch_size,
                )
                .await;

            match batch {
                Ok(jobs) if jobs.is_empty() => {
                    error_streak = 0;
                }
                Ok(jobs) => {
                    debug!(
                        worker.queue.name = %queue,
                        jobs.count = jobs.len(),
                        "Dispatching batch"
                    );
                    self.processor.process_batch(jobs, &cancellation).await;
                    error_streak = 0;
                }
                Err(err) if err.kind == QueueErrorKind::NotFound => {
                    warn!(worker.queue.name = %queue, "Queue missing, recreating: {err}");
                    match self
                        .client
                        .create_queue(&queue, true, &self.channel, &self.event)
                        .await
                    {
                        Ok(_) => error_streak = 0,
                        Err(create_err) => {
                            error!(
                                worker.queue.name = %queue,
                                "Unable to recreate the queue: {create_err}"
                            );
                            error_streak = error_streak.saturating_add(1);
                            if !self
                                .pause(&cancellation, self.backoff.base_delay(error_streak))
                                .await
                            {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    error!(
                        worker.queue.name = %queue,
                        "Reading from the queue failed: {err}"
                    );
                    error_streak = error_streak.saturating_add(1);
                    if !self
                        .pause(&cancellation, self.backoff.base_delay(error_streak))
                        .await
                    {
                        break;
                    }
                }
            }
        }

        let stats = self.counters.snapshot();
        info!(
            worker.queue.name = %queue,
            jobs.succeeded = stats.succeeded,
            jobs.failed = stats.failed,
            jobs.timed_out = stats.timed_out,
            "Queue fiber exiting"
        );
    }

    async fn pause(&self, cancellation: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            biased;

            _ = cancellation.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}
