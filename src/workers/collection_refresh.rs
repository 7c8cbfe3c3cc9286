//! Collection refresh worker: drains the collection-fetch queue and
//! writes the aggregated result through to cache and record store.

use crate::aggregator::CollectionAggregator;
use crate::cache::Cache;
use crate::error::Error;
use crate::models::{cache_keys, CachedCollection, CollectionJob};
use crate::queue::{Job, JobHandler};
use crate::store::CollectionStore;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Tag written into cache payloads produced by this worker.
const CACHE_SOURCE: &str = "worker-cache";

pub struct CollectionRefreshHandler {
    aggregator: Arc<CollectionAggregator>,
    cache: Arc<dyn Cache>,
    store: Arc<dyn CollectionStore>,
    cache_ttl: Duration,
}

impl CollectionRefreshHandler {
    pub fn new(
        aggregator: Arc<CollectionAggregator>,
        cache: Arc<dyn Cache>,
        store: Arc<dyn CollectionStore>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            aggregator,
            cache,
            store,
            cache_ttl,
        }
    }
}

#[async_trait]
impl JobHandler for CollectionRefreshHandler {
    async fn handle(&self, job: &Job) -> Result<Option<Value>, Error> {
        let CollectionJob {
            slug,
            contract_address,
        } = job.data_as().map_err(|e| Error::Queue(e.to_string()))?;

        // Upstream failure propagates so the queue schedules the next
        // attempt with backoff.
        let data = self
            .aggregator
            .fetch_collection_data(&slug, &contract_address)
            .await?;

        let payload = CachedCollection::from_data(&data, CACHE_SOURCE, Utc::now());
        let serialized =
            serde_json::to_string(&payload).map_err(|e| Error::Cache(e.to_string()))?;
        self.cache
            .set(&cache_keys::collection(&slug), &serialized, self.cache_ttl)
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;

        // The cache now serves reads; a store hiccup is not worth a retry
        // that would re-fetch upstream.
        if let Err(e) = self.store.upsert_collection_metadata(&data).await {
            warn!(slug = %slug, error = %e, "Record store upsert failed after refresh");
        }

        info!(slug = %slug, floor = data.floor_price_eth, "Collection refreshed");
        Ok(Some(serde_json::to_value(&payload).unwrap_or(Value::Null)))
    }
}
