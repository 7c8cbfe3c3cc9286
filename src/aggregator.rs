//! Collection aggregator: combined metadata + floor price.
//!
//! Metadata comes from the record store when fresh, else from the
//! marketplace with retry; floor price tries the by-contract provider
//! first and falls back to the marketplace best listing. The floor side
//! never fails, it degrades to 0. The metadata side degrades to a
//! default record on 404 and only errors when the provider failed
//! outright, so callers can tell "unknown collection" from "provider
//! down".

use crate::error::Error;
use crate::gate::Gate;
use crate::models::CollectionData;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::CollectionStore;
use crate::upstream::opensea::MarketplaceApi;
use crate::upstream::{FloorPriceApi, UpstreamError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Floor entry preferred when the by-contract provider lists several
/// marketplaces.
const PREFERRED_MARKETPLACE: &str = "opensea";

pub struct CollectionAggregator {
    marketplace: Arc<dyn MarketplaceApi>,
    floor_provider: Arc<dyn FloorPriceApi>,
    store: Arc<dyn CollectionStore>,
    retry: RetryPolicy,
    /// Bounds concurrent upstream requests. Acquired per attempt, inside
    /// the retry loop, so backoff sleeps never hold a slot.
    gate: Gate,
}

impl CollectionAggregator {
    pub fn new(
        marketplace: Arc<dyn MarketplaceApi>,
        floor_provider: Arc<dyn FloorPriceApi>,
        store: Arc<dyn CollectionStore>,
        retry: RetryPolicy,
        gate: Gate,
    ) -> Self {
        Self {
            marketplace,
            floor_provider,
            store,
            retry,
            gate,
        }
    }

    /// Combined metadata + floor for one collection. `contract_address`
    /// may be empty when unknown; the by-contract floor provider is then
    /// skipped.
    pub async fn fetch_collection_data(
        &self,
        slug: &str,
        contract_address: &str,
    ) -> Result<CollectionData, Error> {
        let (info, floor) = tokio::join!(
            self.fetch_collection_info(slug),
            self.fetch_floor_price(contract_address, slug)
        );

        let mut data = info?;
        data.floor_price_eth = floor;
        Ok(data)
    }

    /// Metadata for a slug: fresh store row, else upstream with retry.
    /// 404 maps to the default record; other failures propagate.
    async fn fetch_collection_info(&self, slug: &str) -> Result<CollectionData, Error> {
        match self.store.find_collection_metadata(slug).await {
            Ok(Some(row)) => {
                debug!(slug, "Collection metadata served from store");
                return Ok(row.data);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(slug, error = %e, "Store read failed, falling through to upstream");
            }
        }

        let marketplace = Arc::clone(&self.marketplace);
        let gate = self.gate.clone();
        let result = with_retry(&self.retry, "collection-info", |_| {
            let marketplace = Arc::clone(&marketplace);
            let gate = gate.clone();
            let slug = slug.to_string();
            async move {
                let _permit = gate.acquire().await;
                marketplace.collection_info(&slug).await
            }
        })
        .await;

        match result {
            Ok(data) => {
                // Write-behind so the fetch path does not wait on the store.
                let store = Arc::clone(&self.store);
                let to_store = data.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.upsert_collection_metadata(&to_store).await {
                        warn!(slug = %to_store.slug, error = %e, "Metadata store write-behind failed");
                    }
                });
                Ok(data)
            }
            Err(UpstreamError::NotFound) => {
                debug!(slug, "Collection unknown upstream, using defaults");
                Ok(CollectionData::default_for_slug(slug))
            }
            Err(e) => Err(Error::Upstream(format!(
                "collection info for {slug}: {e}"
            ))),
        }
    }

    /// Best-effort numeric ETH floor: by-contract provider, then the
    /// marketplace best listing, then 0. Never errors.
    async fn fetch_floor_price(&self, contract_address: &str, slug: &str) -> f64 {
        if !contract_address.is_empty() {
            let provider = Arc::clone(&self.floor_provider);
            let gate = self.gate.clone();
            let result = with_retry(&self.retry, "floor-price", |_| {
                let provider = Arc::clone(&provider);
                let gate = gate.clone();
                let contract = contract_address.to_string();
                async move {
                    let _permit = gate.acquire().await;
                    provider.floor_prices(&contract).await
                }
            })
            .await;

            match result {
                Ok(entries) if !entries.is_empty() => {
                    let preferred = entries
                        .iter()
                        .find(|e| e.marketplace == PREFERRED_MARKETPLACE)
                        .map(|e| e.floor_price_eth);
                    let floor = preferred.unwrap_or_else(|| {
                        entries
                            .iter()
                            .map(|e| e.floor_price_eth)
                            .fold(0.0, f64::max)
                    });
                    return floor;
                }
                Ok(_) => {
                    debug!(contract = contract_address, "No floor entries, trying fallback");
                }
                Err(e) => {
                    warn!(contract = contract_address, error = %e, "Floor provider failed, trying fallback");
                }
            }
        }

        let marketplace = Arc::clone(&self.marketplace);
        let gate = self.gate.clone();
        let fallback = with_retry(&self.retry, "best-listing", |_| {
            let marketplace = Arc::clone(&marketplace);
            let gate = gate.clone();
            let slug = slug.to_string();
            async move {
                let _permit = gate.acquire().await;
                marketplace.best_listing_floor(&slug).await
            }
        })
        .await;

        match fallback {
            Ok(Some(price)) => price,
            Ok(None) => 0.0,
            Err(e) => {
                warn!(slug, error = %e, "Best-listing fallback failed, floor defaults to 0");
                0.0
            }
        }
    }
}
