use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{BillingError, BillingResult};
use crate::worker::queue::{Backoff, Job, PgJobQueue};

/// Executes one kind of named job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job name this handler is registered under.
    fn name(&self) -> &'static str;

    async fn handle(&self, job: &Job) -> BillingResult<()>;

    /// Called once when a retryable failure used up the job's attempts.
    async fn on_exhausted(&self, job: &Job, error: &BillingError) {
        error!(job_id = %job.id, job = %job.name, error = %error, "Job exhausted its retries");
    }
}

/// What to do with a job after one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Retry(Duration),
    /// Retryable failure with no attempts left
    Exhausted,
    /// Permanent failure, never retried
    Failed,
}

/// Decides a job's fate from its result and retry policy.
pub fn disposition(
    result: &BillingResult<()>,
    attempts: i32,
    max_attempts: i32,
    backoff: Backoff,
) -> Disposition {
    match result {
        Ok(()) => Disposition::Completed,
        Err(e) if e.is_retryable() && attempts < max_attempts => {
            Disposition::Retry(backoff.delay_for(attempts))
        }
        Err(e) if e.is_retryable() => Disposition::Exhausted,
        Err(_) => Disposition::Failed,
    }
}

/// Worker pool draining one queue of the durable job table.
#[derive(Clone)]
pub struct JobRunner {
    queue: PgJobQueue,
    queue_name: String,
    handlers: Arc<HashMap<&'static str, Arc<dyn JobHandler>>>,
    worker_count: usize,
    poll_interval: Duration,
}

impl JobRunner {
    pub fn new(
        queue: PgJobQueue,
        queue_name: impl Into<String>,
        handlers: Vec<Arc<dyn JobHandler>>,
        worker_count: usize,
        poll_interval: Duration,
    ) -> Self {
        let handlers = handlers.into_iter().map(|h| (h.name(), h)).collect();
        Self {
            queue,
            queue_name: queue_name.into(),
            handlers: Arc::new(handlers),
            worker_count: worker_count.max(1),
            poll_interval,
        }
    }

    /// Spawns the workers. They stop claiming once `shutdown` is cancelled.
    pub fn start(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(
            queue = %self.queue_name,
            worker_count = self.worker_count,
            "Starting job runner"
        );

        (0..self.worker_count)
            .map(|worker_id| {
                let runner = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { runner.worker_loop(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            match self.queue.claim(&self.queue_name).await {
                Ok(Some(job)) => self.process(worker_id, job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        info!(worker_id, "Job worker stopped");
    }

    async fn process(&self, worker_id: usize, job: Job) {
        info!(
            worker_id,
            job_id = %job.id,
            job = %job.name,
            attempt = job.attempts,
            "Processing job"
        );

        let result = match self.handlers.get(job.name.as_str()) {
            Some(handler) => handler.handle(&job).await,
            None => Err(BillingError::Configuration(format!(
                "no handler registered for job '{}'",
                job.name
            ))),
        };

        let outcome = disposition(&result, job.attempts, job.max_attempts, job.backoff());
        let stored = match (outcome, &result) {
            (Disposition::Completed, _) => self.queue.complete(&job).await,
            (Disposition::Retry(delay), Err(e)) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Job failed, will retry"
                );
                self.queue.retry(&job, delay, &e.to_string()).await
            }
            (Disposition::Exhausted, Err(e)) => {
                if let Some(handler) = self.handlers.get(job.name.as_str()) {
                    handler.on_exhausted(&job, e).await;
                }
                self.queue.fail(&job, &e.to_string()).await
            }
            (_, Err(e)) => {
                error!(job_id = %job.id, kind = e.kind(), error = %e, "Job failed permanently");
                self.queue.fail(&job, &e.to_string()).await
            }
            (_, Ok(())) => self.queue.complete(&job).await,
        };

        // The lease expires and the job is redelivered if this write is lost.
        match stored {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, attempt = job.attempts, "Job lease lost, outcome left to the newer delivery");
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to record job outcome"),
        }
    }
}
