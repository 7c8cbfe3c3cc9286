//! Redis-backed queue implementation.
//!
//! Layout per queue name `q`:
//! - `queue:q:waiting`: LIST of job ids, LPUSH/RPOP (FIFO).
//! - `queue:q:delayed`: ZSET job id → promote-at (unix ms).
//! - `queue:q:job:{id}`: HASH with data, state, attempts and results.
//! - `queue:q:dedup:{id}`: SETNX gate, exists exactly while the job is
//!   non-terminal. This is what makes `add` race-free across processes.
//! - `queue:q:completed` / `queue:q:failed`: ZSET job id → finished-at,
//!   trimmed by retention count and age.

use crate::queue::{
    retry_backoff, Job, JobOptions, JobQueue, JobState, QueueDepth, QueueError, RetentionPolicy,
};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde_json::Value;
use tracing::warn;

/// Delayed jobs promoted per `take_next` call.
const PROMOTE_BATCH: usize = 100;

#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
}

impl RedisJobQueue {
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(QueueError::from)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(QueueError::from)?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn k_waiting(queue: &str) -> String {
        format!("queue:{queue}:waiting")
    }

    fn k_delayed(queue: &str) -> String {
        format!("queue:{queue}:delayed")
    }

    fn k_job(queue: &str, id: &str) -> String {
        format!("queue:{queue}:job:{id}")
    }

    fn k_dedup(queue: &str, id: &str) -> String {
        format!("queue:{queue}:dedup:{id}")
    }

    fn k_finished(queue: &str, state: JobState) -> String {
        match state {
            JobState::Failed => format!("queue:{queue}:failed"),
            _ => format!("queue:{queue}:completed"),
        }
    }

    async fn write_job(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(Self::k_job(&job.queue, &job.id))
            .arg("id")
            .arg(&job.id)
            .arg("data")
            .arg(job.data.to_string())
            .arg("state")
            .arg(job.state.as_str())
            .arg("attempts_made")
            .arg(job.attempts_made)
            .arg("opts")
            .arg(serde_json::to_string(&job.options).map_err(|e| QueueError(e.to_string()))?)
            .arg("enqueued_at_ms")
            .arg(job.enqueued_at_ms);
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn read_job(&self, queue: &str, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: std::collections::HashMap<String, String> = redis::cmd("HGETALL")
            .arg(Self::k_job(queue, id))
            .query_async(&mut conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let get = |k: &str| fields.get(k).cloned();
        let options: JobOptions = match get("opts").and_then(|o| serde_json::from_str(&o).ok()) {
            Some(o) => o,
            None => return Err(QueueError(format!("job {id} has unreadable options"))),
        };
        let state = get("state")
            .as_deref()
            .and_then(JobState::parse)
            .unwrap_or(JobState::Waiting);

        Ok(Some(Job {
            id: id.to_string(),
            queue: queue.to_string(),
            data: get("data")
                .and_then(|d| serde_json::from_str(&d).ok())
                .unwrap_or(Value::Null),
            state,
            attempts_made: get("attempts_made")
                .and_then(|a| a.parse().ok())
                .unwrap_or(0),
            options,
            progress: get("progress").and_then(|p| serde_json::from_str(&p).ok()),
            last_error: get("last_error"),
            result: get("result").and_then(|r| serde_json::from_str(&r).ok()),
            enqueued_at_ms: get("enqueued_at_ms")
                .and_then(|t| t.parse().ok())
                .unwrap_or(0),
            finished_at_ms: get("finished_at_ms").and_then(|t| t.parse().ok()),
        }))
    }

    /// Promote delayed jobs whose time has come back onto the waiting
    /// list. ZREM is the claim: only one promoter wins per job.
    async fn promote_due(&self, queue: &str) -> Result<(), QueueError> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(Self::k_delayed(queue))
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await?;

        for id in due {
            let removed: u64 = redis::cmd("ZREM")
                .arg(Self::k_delayed(queue))
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            if removed == 1 {
                redis::cmd("HSET")
                    .arg(Self::k_job(queue, &id))
                    .arg("state")
                    .arg(JobState::Waiting.as_str())
                    .query_async::<_, ()>(&mut conn)
                    .await?;
                redis::cmd("LPUSH")
                    .arg(Self::k_waiting(queue))
                    .arg(&id)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
        }
        Ok(())
    }

    /// Drop retained jobs past the policy's age or count.
    async fn trim_retention(
        &self,
        queue: &str,
        set_key: &str,
        policy: &RetentionPolicy,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let cutoff = Utc::now().timestamp_millis() - policy.age.as_millis() as i64;

        let aged: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(set_key)
            .arg("-inf")
            .arg(cutoff)
            .query_async(&mut conn)
            .await?;
        if !aged.is_empty() {
            let mut pipe = redis::pipe();
            for id in &aged {
                pipe.cmd("DEL").arg(Self::k_job(queue, id));
                pipe.cmd("ZREM").arg(set_key).arg(id);
            }
            pipe.query_async::<_, ()>(&mut conn).await?;
        }

        let card: u64 = redis::cmd("ZCARD")
            .arg(set_key)
            .query_async(&mut conn)
            .await?;
        if card as usize > policy.count {
            let excess = card as usize - policy.count;
            let oldest: Vec<String> = redis::cmd("ZRANGE")
                .arg(set_key)
                .arg(0)
                .arg(excess as i64 - 1)
                .query_async(&mut conn)
                .await?;
            let mut pipe = redis::pipe();
            for id in &oldest {
                pipe.cmd("DEL").arg(Self::k_job(queue, id));
                pipe.cmd("ZREM").arg(set_key).arg(id);
            }
            pipe.query_async::<_, ()>(&mut conn).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn add(
        &self,
        queue: &str,
        job_id: &str,
        data: Value,
        options: &JobOptions,
    ) -> Result<Job, QueueError> {
        let mut conn = self.conn.clone();

        let claimed: Option<String> = redis::cmd("SET")
            .arg(Self::k_dedup(queue, job_id))
            .arg("1")
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        if claimed.is_none() {
            match self.read_job(queue, job_id).await? {
                // A non-terminal job with this id already exists.
                Some(existing) if !existing.state.is_terminal() => return Ok(existing),
                // A terminal job behind a leftover gate, or a gate with no
                // job at all: both mean a half-finished settle. Rewrite.
                _ => warn!(queue, job_id, "Re-creating job behind stale dedup key"),
            }
        }

        // Clear any terminal leftovers before re-adding.
        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(Self::k_job(queue, job_id));
        pipe.cmd("ZREM")
            .arg(Self::k_finished(queue, JobState::Completed))
            .arg(job_id);
        pipe.cmd("ZREM")
            .arg(Self::k_finished(queue, JobState::Failed))
            .arg(job_id);
        pipe.query_async::<_, ()>(&mut conn).await?;

        let job = Job {
            id: job_id.to_string(),
            queue: queue.to_string(),
            data,
            state: JobState::Waiting,
            attempts_made: 0,
            options: *options,
            progress: None,
            last_error: None,
            result: None,
            enqueued_at_ms: Utc::now().timestamp_millis(),
            finished_at_ms: None,
        };
        self.write_job(&job).await?;

        redis::cmd("LPUSH")
            .arg(Self::k_waiting(queue))
            .arg(job_id)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(job)
    }

    async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.read_job(queue, job_id).await
    }

    async fn update_progress(
        &self,
        queue: &str,
        job_id: &str,
        progress: Value,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let exists: u64 = redis::cmd("EXISTS")
            .arg(Self::k_job(queue, job_id))
            .query_async(&mut conn)
            .await?;
        if exists == 0 {
            return Ok(());
        }
        redis::cmd("HSET")
            .arg(Self::k_job(queue, job_id))
            .arg("progress")
            .arg(progress.to_string())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn take_next(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        self.promote_due(queue).await?;

        let mut conn = self.conn.clone();
        let popped: Option<String> = redis::cmd("RPOP")
            .arg(Self::k_waiting(queue))
            .query_async(&mut conn)
            .await?;
        let id = match popped {
            Some(id) => id,
            None => return Ok(None),
        };

        let exists: u64 = redis::cmd("EXISTS")
            .arg(Self::k_job(queue, &id))
            .query_async(&mut conn)
            .await?;
        if exists == 0 {
            // Orphaned id (retention removed the hash). Release the gate.
            redis::cmd("DEL")
                .arg(Self::k_dedup(queue, &id))
                .query_async::<_, ()>(&mut conn)
                .await?;
            return Ok(None);
        }

        redis::cmd("HINCRBY")
            .arg(Self::k_job(queue, &id))
            .arg("attempts_made")
            .arg(1)
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("HSET")
            .arg(Self::k_job(queue, &id))
            .arg("state")
            .arg(JobState::Active.as_str())
            .query_async::<_, ()>(&mut conn)
            .await?;

        self.read_job(queue, &id).await
    }

    async fn complete(&self, job: &Job, result: Option<Value>) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();

        let mut cmd = redis::cmd("HSET");
        cmd.arg(Self::k_job(&job.queue, &job.id))
            .arg("state")
            .arg(JobState::Completed.as_str())
            .arg("finished_at_ms")
            .arg(now);
        if let Some(result) = result {
            cmd.arg("result").arg(result.to_string());
        }
        cmd.query_async::<_, ()>(&mut conn).await?;

        redis::cmd("DEL")
            .arg(Self::k_dedup(&job.queue, &job.id))
            .query_async::<_, ()>(&mut conn)
            .await?;

        let set_key = Self::k_finished(&job.queue, JobState::Completed);
        redis::cmd("ZADD")
            .arg(&set_key)
            .arg(now)
            .arg(&job.id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        self.trim_retention(&job.queue, &set_key, &job.options.remove_on_complete)
            .await
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();

        if job.attempts_made < job.options.attempts {
            let delay = retry_backoff(&job.options, job.attempts_made);
            let promote_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            redis::cmd("HSET")
                .arg(Self::k_job(&job.queue, &job.id))
                .arg("state")
                .arg(JobState::Delayed.as_str())
                .arg("last_error")
                .arg(error)
                .query_async::<_, ()>(&mut conn)
                .await?;
            redis::cmd("ZADD")
                .arg(Self::k_delayed(&job.queue))
                .arg(promote_at)
                .arg(&job.id)
                .query_async::<_, ()>(&mut conn)
                .await?;
            return Ok(());
        }

        let now = Utc::now().timestamp_millis();
        redis::cmd("HSET")
            .arg(Self::k_job(&job.queue, &job.id))
            .arg("state")
            .arg(JobState::Failed.as_str())
            .arg("last_error")
            .arg(error)
            .arg("finished_at_ms")
            .arg(now)
            .query_async::<_, ()>(&mut conn)
            .await?;
        redis::cmd("DEL")
            .arg(Self::k_dedup(&job.queue, &job.id))
            .query_async::<_, ()>(&mut conn)
            .await?;

        let set_key = Self::k_finished(&job.queue, JobState::Failed);
        redis::cmd("ZADD")
            .arg(&set_key)
            .arg(now)
            .arg(&job.id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        self.trim_retention(&job.queue, &set_key, &job.options.remove_on_fail)
            .await
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError> {
        let mut conn = self.conn.clone();
        let waiting: u64 = redis::cmd("LLEN")
            .arg(Self::k_waiting(queue))
            .query_async(&mut conn)
            .await?;
        let delayed: u64 = redis::cmd("ZCARD")
            .arg(Self::k_delayed(queue))
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepth { waiting, delayed })
    }
}
