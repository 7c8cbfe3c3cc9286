//! Process metrics (lock-free atomics, zero allocation on hot path).

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // --- Traffic ---
    pub requests_total: AtomicU64,

    // --- Cache ---
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,

    // --- Upstream ---
    pub upstream_calls: AtomicU64,
    pub upstream_retries: AtomicU64,
    pub upstream_rate_limits: AtomicU64,
    pub upstream_errors: AtomicU64,

    // --- Jobs ---
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,

    // --- Syncs ---
    pub syncs_started: AtomicU64,
    pub events_upserted: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            upstream_calls: AtomicU64::new(0),
            upstream_retries: AtomicU64::new(0),
            upstream_rate_limits: AtomicU64::new(0),
            upstream_errors: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            syncs_started: AtomicU64::new(0),
            events_upserted: AtomicU64::new(0),
        }
    }

    /// Render in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        for (name, value) in [
            ("gateway_requests_total", &self.requests_total),
            ("gateway_cache_hits_total", &self.cache_hits),
            ("gateway_cache_misses_total", &self.cache_misses),
            ("gateway_upstream_calls_total", &self.upstream_calls),
            ("gateway_upstream_retries_total", &self.upstream_retries),
            ("gateway_upstream_rate_limits_total", &self.upstream_rate_limits),
            ("gateway_upstream_errors_total", &self.upstream_errors),
            ("gateway_jobs_completed_total", &self.jobs_completed),
            ("gateway_jobs_failed_total", &self.jobs_failed),
            ("gateway_syncs_started_total", &self.syncs_started),
            ("gateway_events_upserted_total", &self.events_upserted),
        ] {
            out.push_str(&format!(
                "# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_every_counter() {
        let m = Metrics::new();
        m.cache_hits.fetch_add(3, Ordering::Relaxed);
        let text = m.render();
        assert!(text.contains("gateway_cache_hits_total 3"));
        assert!(text.contains("# TYPE gateway_jobs_failed_total counter"));
    }
}
