//! Per-queue job execution: invoke the pipeline under a deadline, then
//! finalize the message.

use crate::client::QueueClient;
use crate::job::Job;
use crate::pipeline::{Context, PipelineError, Runnable};
use crate::worker::descriptor::QueueDescriptor;
use serde_derive::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Per-queue execution counters. Shared append-only state; snapshot for
/// reporting.
#[derive(Debug, Default)]
pub struct QueueCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl QueueCounters {
    pub fn snapshot(&self) -> QueueStats {
        QueueStats {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a queue's counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
}

/// Turns `(descriptor, job)` pairs into finalized outcomes.
#[derive(Clone)]
pub(crate) struct QueueProcessor {
    descriptor: QueueDescriptor,
    client: QueueClient,
    counters: Arc<QueueCounters>,
}

impl QueueProcessor {
    pub(crate) fn new(
        descriptor: QueueDescriptor,
        client: QueueClient,
        counters: Arc<QueueCounters>,
    ) -> Self {
        Self {
            descriptor,
            client,
            counters,
        }
    }

    /// Dispatch a batch concurrently, in read order. Resolves once every job
    /// has finalized or timed out; the read's `batch_size` bounds the
    /// concurrency.
    pub(crate) async fn process_batch(&self, jobs: Vec<Job>, shutdown: &CancellationToken) {
        let mut executions = JoinSet::new();
        for mut job in jobs {
            job.tags = self.descriptor.policy().tags.clone();
            let processor = self.clone();
            let deadline = shutdown.child_token();
            executions.spawn(async move { processor.process_job(job, deadline).await });
        }

        while let Some(result) = executions.join_next().await {
            if let Err(join_err) = result {
                error!(
                    worker.queue.name = self.descriptor.name(),
                    "A job execution task failed to join: {join_err}"
                );
            }
        }
    }

    async fn process_job(&self, job: Job, cancellation: CancellationToken) {
        let span = info_span!(
            "job",
            worker.queue.name = %job.queue_name,
            job.msg_id = job.message_id,
            job.read_count = job.read_count,
        );
        self.run_job(job, cancellation).instrument(span).await;
    }

    async fn run_job(&self, job: Job, cancellation: CancellationToken) {
        let policy = self.descriptor.policy();
        let started = Instant::now();
        let context = Context::with_cancellation(job.metadata(), cancellation.clone());
        let payload = Value::Object(job.payload.clone());

        let outcome = timeout(
            policy.timeout,
            self.descriptor.runnable().invoke(payload, &context),
        )
        .await;

        match outcome {
            Ok(Ok(output)) if !output.is_object() => {
                // Queue-bound pipelines must produce mappings at the top
                // level; anything else is a deterministic failure.
                let err = PipelineError::failed(
                    self.descriptor.runnable().name(),
                    format!(
                        "pipeline output must be a mapping, got {}",
                        crate::job::json_type_name(&output)
                    ),
                );
                self.job_failed(&job, &err).await;
            }
            Ok(Ok(_output)) => {
                self.finalize_success(&job).await;
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(
                    job.duration_ms = started.elapsed().as_millis() as u64,
                    "job_succeeded"
                );
            }
            Ok(Err(err)) => {
                self.job_failed(&job, &err).await;
            }
            Err(_elapsed) => {
                // Propagate the soft stop to anything the runnable spawned,
                // then leave the message alone: PGMQ redelivers it after the
                // visibility timeout.
                cancellation.cancel();
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    job.duration_ms = started.elapsed().as_millis() as u64,
                    job.timeout_secs = policy.timeout.as_secs(),
                    "job_timeout"
                );
            }
        }
    }

    async fn job_failed(&self, job: &Job, err: &PipelineError) {
        // Archive, never delete: bad payloads stay visible for audit while
        // redelivery stops.
        self.finalize(job, false).await;
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            pipeline.transform = %err.transform,
            "job_failed: {err}"
        );
    }

    async fn finalize_success(&self, job: &Job) {
        self.finalize(job, self.descriptor.policy().delete_on_finish)
            .await;
    }

    /// The client already retries transient transport failures; if the
    /// operation still fails, the message is left for redelivery.
    async fn finalize(&self, job: &Job, delete: bool) {
        let result = if delete {
            self.client.delete(&job.queue_name, job.message_id).await
        } else {
            self.client.archive(&job.queue_name, job.message_id).await
        };

        match result {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    job.finalize_delete = delete,
                    "Message was already finalized elsewhere"
                );
            }
            Err(err) => {
                error!(
                    job.finalize_delete = delete,
                    "finalize_failed: {err}"
                );
            }
        }
    }
}
