//! Collection cache-fetch service.
//!
//! Batch reads against the hot cache only: hits come back immediately,
//! misses come back as placeholders while a refresh job is enqueued
//! behind the response. Response time is bounded by one cache read.

use crate::cache::Cache;
use crate::error::Error;
use crate::models::{cache_keys, parse_cached_collection, CachedCollection, CollectionJob};
use crate::queue::{collection_job_options, JobQueue, COLLECTION_QUEUE};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on slugs per batch request.
const MAX_BATCH_SLUGS: usize = 100;

pub struct CollectionService {
    cache: Arc<dyn Cache>,
    queue: Arc<dyn JobQueue>,
}

impl CollectionService {
    pub fn new(cache: Arc<dyn Cache>, queue: Arc<dyn JobQueue>) -> Self {
        Self { cache, queue }
    }

    /// Cache-only batch read. Every requested slug appears in the result;
    /// `None` marks a miss that is now queued for refresh.
    pub async fn get_batch_from_cache(
        &self,
        slugs: &[String],
    ) -> Result<HashMap<String, Option<CachedCollection>>, Error> {
        if slugs.is_empty() {
            return Err(Error::InvalidInput("slugs must not be empty".into()));
        }
        if slugs.len() > MAX_BATCH_SLUGS {
            return Err(Error::InvalidInput(format!(
                "at most {MAX_BATCH_SLUGS} slugs per request"
            )));
        }
        if slugs.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::InvalidInput("slugs must be non-empty strings".into()));
        }

        let keys: Vec<String> = slugs.iter().map(|s| cache_keys::collection(s)).collect();
        let payloads = match self.cache.mget(&keys).await {
            Ok(values) => values,
            Err(e) => {
                // A cache outage degrades every slug to a miss.
                warn!(error = %e, "Batch cache read failed");
                vec![None; slugs.len()]
            }
        };

        let mut results: HashMap<String, Option<CachedCollection>> = HashMap::new();
        let mut missing: Vec<String> = Vec::new();
        for (slug, payload) in slugs.iter().zip(payloads) {
            let parsed = payload.as_deref().and_then(parse_cached_collection);
            if parsed.is_none() {
                missing.push(slug.clone());
            }
            results.insert(slug.clone(), parsed);
        }

        if !missing.is_empty() {
            debug!(count = missing.len(), "Queueing cache misses for refresh");
            let queue = Arc::clone(&self.queue);
            // Enqueue behind the response; a queue hiccup must not block
            // or fail the read.
            tokio::spawn(async move {
                enqueue_collections(&queue, &missing).await;
            });
        }

        Ok(results)
    }
}

/// Enqueue refresh jobs for a set of slugs, deduplicated by job id = slug.
pub async fn enqueue_collections(queue: &Arc<dyn JobQueue>, slugs: &[String]) {
    let options = collection_job_options();
    for slug in slugs {
        let job = CollectionJob {
            slug: slug.clone(),
            contract_address: String::new(),
        };
        let data = match serde_json::to_value(&job) {
            Ok(data) => data,
            Err(e) => {
                warn!(slug = %slug, error = %e, "Unserializable collection job");
                continue;
            }
        };
        if let Err(e) = queue.add(COLLECTION_QUEUE, slug, data, &options).await {
            warn!(slug = %slug, error = %e, "Failed to enqueue collection refresh");
        }
    }
}
