//! Retry executor: exponential backoff with a jitter cap,
//! Retry-After honoring and non-retryable classification.

use crate::metrics::METRICS;
use crate::upstream::UpstreamError;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Extra margin added on top of a provider's Retry-After hint.
const RETRY_AFTER_MARGIN: Duration = Duration::from_millis(200);
/// Upper bound on the random jitter added to each backoff delay.
const JITTER_CAP: Duration = Duration::from_millis(250);

/// Backoff parameters for one call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Delay before the retry that follows `attempt` (1-based).
    ///
    /// Exponential from `initial_delay`, raised to at least the provider's
    /// Retry-After hint plus a margin, capped at `max_delay`. Jitter is
    /// added inside the cap so the bound holds.
    pub fn backoff_delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let exp = self
            .initial_delay
            .saturating_mul(1u32 << (attempt - 1).min(16));
        let mut delay = exp;
        if let Some(secs) = retry_after_secs {
            let hinted = Duration::from_secs(secs) + RETRY_AFTER_MARGIN;
            delay = delay.max(hinted);
        }
        let jitter =
            Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_CAP.as_millis() as u64));
        (delay + jitter).min(self.max_delay)
    }
}

/// Run `operation` under `policy`, retrying rate-limit and transient
/// failures. Client errors and 404s return immediately. The sleep between
/// attempts holds no permits; call sites acquire gates inside the closure.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    operation: F,
) -> Result<T, UpstreamError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    with_retry_until(policy, None, op_name, operation).await
}

/// Like [`with_retry`], additionally honoring a caller-supplied deadline:
/// no retry is scheduled past it.
pub async fn with_retry_until<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Option<Instant>,
    op_name: &str,
    mut operation: F,
) -> Result<T, UpstreamError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 1u32;
    loop {
        METRICS.upstream_calls.fetch_add(1, Ordering::Relaxed);
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                METRICS.upstream_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            Err(e) => {
                if matches!(e, UpstreamError::RateLimited { .. }) {
                    METRICS.upstream_rate_limits.fetch_add(1, Ordering::Relaxed);
                }
                if attempt >= policy.max_attempts {
                    METRICS.upstream_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(op = op_name, attempts = attempt, error = %e, "Retries exhausted");
                    return Err(e);
                }
                METRICS.upstream_retries.fetch_add(1, Ordering::Relaxed);

                let retry_after = match &e {
                    UpstreamError::RateLimited { retry_after } => *retry_after,
                    _ => None,
                };
                let delay = policy.backoff_delay(attempt, retry_after);

                if let Some(deadline) = deadline {
                    if Instant::now() + delay >= deadline {
                        warn!(op = op_name, attempts = attempt, "Deadline reached, not retrying");
                        return Err(e);
                    }
                }

                debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying upstream call"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
