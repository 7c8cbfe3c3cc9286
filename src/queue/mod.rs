//! Durable named job queues with per-key deduplication, delayed
//! retries with exponential backoff, and bounded result retention.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

pub mod redis;
pub mod worker;

pub use worker::{run_worker, JobHandler, WorkerOptions};

pub const COLLECTION_QUEUE: &str = "collection-fetch-queue";
pub const PORTFOLIO_QUEUE: &str = "portfolio-fetch-queue";

#[derive(Debug)]
pub struct QueueError(pub String);

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue error: {}", self.0)
    }
}

impl std::error::Error for QueueError {}

impl From<::redis::RedisError> for QueueError {
    fn from(e: ::redis::RedisError) -> Self {
        QueueError(e.to_string())
    }
}

/// How many finished jobs to keep, and for how long.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetentionPolicy {
    pub count: usize,
    #[serde(with = "duration_ms")]
    pub age: Duration,
}

/// Per-job options fixed at enqueue time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    /// Total handler attempts before the job lands in failed retention.
    pub attempts: u32,
    /// Base delay of the exponential re-queue backoff.
    #[serde(with = "duration_ms")]
    pub backoff_delay: Duration,
    pub remove_on_complete: RetentionPolicy,
    pub remove_on_fail: RetentionPolicy,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Options for the collection refresh queue.
pub fn collection_job_options() -> JobOptions {
    JobOptions {
        attempts: 4,
        backoff_delay: Duration::from_millis(1000),
        remove_on_complete: RetentionPolicy {
            count: 1000,
            age: Duration::from_secs(24 * 3600),
        },
        remove_on_fail: RetentionPolicy {
            count: 5000,
            age: Duration::from_secs(7 * 24 * 3600),
        },
    }
}

/// Options for the portfolio calculation queue.
pub fn portfolio_job_options() -> JobOptions {
    JobOptions {
        attempts: 3,
        backoff_delay: Duration::from_secs(60),
        remove_on_complete: RetentionPolicy {
            count: 100,
            age: Duration::from_secs(3600),
        },
        remove_on_fail: RetentionPolicy {
            count: 1000,
            age: Duration::from_secs(24 * 3600),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "delayed" => Some(JobState::Delayed),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// A queued unit of work. `id` doubles as the deduplication key: at most
/// one job per id is ever in a non-terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub data: Value,
    pub state: JobState,
    pub attempts_made: u32,
    pub options: JobOptions,
    pub progress: Option<Value>,
    pub last_error: Option<String>,
    pub result: Option<Value>,
    pub enqueued_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

impl Job {
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| QueueError(format!("bad job data for {}: {e}", self.id)))
    }
}

/// Queue depths, for health reporting.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueDepth {
    pub waiting: u64,
    pub delayed: u64,
}

/// Named durable queues.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue with deduplication: if a job with this id is waiting,
    /// active or delayed, no new job is created and the existing one is
    /// returned. A terminal job with the same id is removed and replaced.
    async fn add(
        &self,
        queue: &str,
        job_id: &str,
        data: Value,
        options: &JobOptions,
    ) -> Result<Job, QueueError>;

    async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<Job>, QueueError>;

    /// Best-effort progress telemetry; failures are non-fatal.
    async fn update_progress(
        &self,
        queue: &str,
        job_id: &str,
        progress: Value,
    ) -> Result<(), QueueError>;

    /// Promote due delayed jobs, then pop the oldest waiting job and mark
    /// it active (incrementing its attempt count). `None` when idle.
    async fn take_next(&self, queue: &str) -> Result<Option<Job>, QueueError>;

    /// Mark an active job completed and apply completion retention.
    async fn complete(&self, job: &Job, result: Option<Value>) -> Result<(), QueueError>;

    /// Record a failed attempt: re-queue with exponential backoff until
    /// attempts are exhausted, then land in failed retention.
    async fn fail(&self, job: &Job, error: &str) -> Result<(), QueueError>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError>;
}

/// Re-queue delay after `attempts_made` attempts, exponential from the
/// job's base backoff.
pub fn retry_backoff(options: &JobOptions, attempts_made: u32) -> Duration {
    let exp = attempts_made.saturating_sub(1).min(16);
    options.backoff_delay.saturating_mul(1u32 << exp)
}
