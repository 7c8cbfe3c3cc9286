//! Queue worker loop: polls a named queue with bounded concurrency and
//! settles each job through the handler.

use crate::error::Error;
use crate::metrics::METRICS;
use crate::queue::{Job, JobQueue};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Processes one job. An `Err` re-queues the job (with backoff) until its
/// attempts are exhausted.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Option<Value>, Error>;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Take one job off the queue and settle it. Returns whether a job was
/// processed. Split out from [`run_worker`] so tests can drive the loop.
pub async fn process_next(
    queue: &Arc<dyn JobQueue>,
    queue_name: &str,
    handler: &Arc<dyn JobHandler>,
) -> Result<bool, Error> {
    let job = queue
        .take_next(queue_name)
        .await
        .map_err(|e| Error::Queue(e.to_string()))?;
    let job = match job {
        Some(job) => job,
        None => return Ok(false),
    };

    settle(queue, handler, job).await;
    Ok(true)
}

async fn settle(queue: &Arc<dyn JobQueue>, handler: &Arc<dyn JobHandler>, job: Job) {
    match handler.handle(&job).await {
        Ok(result) => {
            METRICS.jobs_completed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = queue.complete(&job, result).await {
                error!(queue = %job.queue, job_id = %job.id, error = %e, "Failed to mark job completed");
            }
        }
        Err(e) => {
            METRICS.jobs_failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                queue = %job.queue,
                job_id = %job.id,
                attempt = job.attempts_made,
                max_attempts = job.options.attempts,
                error = %e,
                "Job attempt failed"
            );
            if let Err(e) = queue.fail(&job, &e.to_string()).await {
                error!(queue = %job.queue, job_id = %job.id, error = %e, "Failed to record job failure");
            }
        }
    }
}

/// Poll `queue_name` forever, running up to `concurrency` jobs at once.
/// Call from a `tokio::spawn`.
pub async fn run_worker(
    queue: Arc<dyn JobQueue>,
    queue_name: &'static str,
    handler: Arc<dyn JobHandler>,
    options: WorkerOptions,
) {
    info!(
        queue = queue_name,
        concurrency = options.concurrency,
        "Worker started"
    );
    let slots = Arc::new(Semaphore::new(options.concurrency.max(1)));

    loop {
        let permit = Arc::clone(&slots)
            .acquire_owned()
            .await
            .expect("worker semaphore is never closed");

        match queue.take_next(queue_name).await {
            Ok(Some(job)) => {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    settle(&queue, &handler, job).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::time::sleep(options.poll_interval).await;
            }
            Err(e) => {
                drop(permit);
                error!(queue = queue_name, error = %e, "Queue poll failed");
                tokio::time::sleep(options.poll_interval).await;
            }
        }
    }
}
