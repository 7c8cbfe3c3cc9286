//! Portfolio calculator worker: exhaust the wallet NFT listing,
//! fan out over unique collections under a gate, reduce to a valuation
//! summary and cache it.

use crate::aggregator::CollectionAggregator;
use crate::cache::Cache;
use crate::error::Error;
use crate::gate::Gate;
use crate::models::{
    cache_keys, CollectionHolding, PortfolioJob, PortfolioSummary, WalletNft,
};
use crate::prices::QuoteCache;
use crate::queue::{Job, JobHandler, JobQueue};
use crate::retry::{with_retry, RetryPolicy};
use crate::upstream::opensea::MarketplaceApi;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Wallet NFTs requested per listing page.
pub const NFT_PAGE_LIMIT: u32 = 200;

/// Lifetime of a cached listing page. Short: it only has to absorb
/// repeated calculations and retries, not serve as truth.
const NFT_PAGE_TTL: Duration = Duration::from_secs(600);

/// Cached form of one wallet listing page.
#[derive(serde::Serialize, serde::Deserialize)]
struct CachedNftPage {
    nfts: Vec<WalletNft>,
    next: Option<String>,
}

/// One holding-in-progress: every wallet NFT of a single collection.
struct CollectionGroup {
    slug: String,
    contract_address: String,
    nft_count: u64,
}

pub struct PortfolioHandler {
    marketplace: Arc<dyn MarketplaceApi>,
    aggregator: Arc<CollectionAggregator>,
    cache: Arc<dyn Cache>,
    queue: Arc<dyn JobQueue>,
    quotes: QuoteCache,
    gate: Gate,
    retry: RetryPolicy,
    max_pages: u32,
    page_limit: u32,
    cache_ttl: Duration,
}

impl PortfolioHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        marketplace: Arc<dyn MarketplaceApi>,
        aggregator: Arc<CollectionAggregator>,
        cache: Arc<dyn Cache>,
        queue: Arc<dyn JobQueue>,
        quotes: QuoteCache,
        fan_out: usize,
        retry: RetryPolicy,
        max_pages: u32,
        page_limit: u32,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            marketplace,
            aggregator,
            cache,
            queue,
            quotes,
            gate: Gate::new(fan_out),
            retry,
            max_pages,
            page_limit,
            cache_ttl,
        }
    }

    async fn report(&self, job: &Job, progress: Value) {
        if let Err(e) = self
            .queue
            .update_progress(&job.queue, &job.id, progress)
            .await
        {
            warn!(job_id = %job.id, error = %e, "Progress update failed");
        }
    }

    /// Pull every wallet NFT, page by page, up to the page cap. Pages are
    /// cached under `nft_page:*` so back-to-back calculations do not
    /// re-walk the listing. Any page that fails after retries aborts the
    /// calculation.
    async fn fetch_all_nfts(&self, address: &str) -> Result<Vec<WalletNft>, Error> {
        let mut nfts = Vec::new();
        let mut cursor: Option<String> = None;
        for _page in 0..self.max_pages {
            let page_key = format!(
                "nft_page:{address}:{}",
                cursor.as_deref().unwrap_or("start")
            );
            if let Ok(Some(payload)) = self.cache.get(&page_key).await {
                if let Ok(cached) = serde_json::from_str::<CachedNftPage>(&payload) {
                    nfts.extend(cached.nfts);
                    cursor = cached.next;
                    if cursor.is_none() {
                        break;
                    }
                    continue;
                }
            }

            let marketplace = Arc::clone(&self.marketplace);
            let page = with_retry(&self.retry, "account-nfts", |_| {
                let marketplace = Arc::clone(&marketplace);
                let address = address.to_string();
                let cursor = cursor.clone();
                let limit = self.page_limit;
                async move {
                    marketplace
                        .account_nfts_page(&address, cursor.as_deref(), limit)
                        .await
                }
            })
            .await
            .map_err(|e| Error::Upstream(format!("nft listing for {address}: {e}")))?;

            let cached = CachedNftPage {
                nfts: page.nfts.clone(),
                next: page.next_cursor.clone(),
            };
            if let Ok(payload) = serde_json::to_string(&cached) {
                if let Err(e) = self.cache.set(&page_key, &payload, NFT_PAGE_TTL).await {
                    warn!(key = %page_key, error = %e, "NFT page cache write failed");
                }
            }

            nfts.extend(page.nfts);
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(nfts)
    }

    async fn write_summary(&self, address: &str, summary: &PortfolioSummary) -> Result<(), Error> {
        let payload = serde_json::to_string(summary).map_err(|e| Error::Cache(e.to_string()))?;
        self.cache
            .set(
                &cache_keys::portfolio_summary(address),
                &payload,
                self.cache_ttl,
            )
            .await
            .map_err(|e| Error::Cache(e.to_string()))
    }
}

fn group_by_collection(nfts: &[WalletNft]) -> BTreeMap<String, CollectionGroup> {
    let mut groups: BTreeMap<String, CollectionGroup> = BTreeMap::new();
    for nft in nfts {
        groups
            .entry(nft.collection.clone())
            .and_modify(|g| g.nft_count += 1)
            .or_insert_with(|| CollectionGroup {
                slug: nft.collection.clone(),
                contract_address: nft.contract.clone(),
                nft_count: 1,
            });
    }
    groups
}

#[async_trait]
impl JobHandler for PortfolioHandler {
    async fn handle(&self, job: &Job) -> Result<Option<Value>, Error> {
        let PortfolioJob { address } = job.data_as().map_err(|e| Error::Queue(e.to_string()))?;
        self.report(job, json!({"step": "started"})).await;

        let nfts = match self.fetch_all_nfts(&address).await {
            Ok(nfts) => nfts,
            Err(e) => {
                self.report(job, json!({"step": "error", "message": e.to_string()}))
                    .await;
                return Err(e);
            }
        };
        let nft_count = nfts.len() as u64;
        self.report(job, json!({"step": "fetched_nfts", "nftCount": nft_count}))
            .await;

        let eth_price_usd = self.quotes.eth_usd();

        if nfts.is_empty() {
            let summary = PortfolioSummary::empty(eth_price_usd, Utc::now());
            self.write_summary(&address, &summary).await?;
            self.report(job, json!({"step": "completed", "nftCount": 0}))
                .await;
            info!(account = %address, "Portfolio is empty");
            return Ok(Some(json!({"totalValueEth": 0.0, "nftCount": 0})));
        }

        let groups = group_by_collection(&nfts);
        let collection_count = groups.len() as u64;
        self.report(
            job,
            json!({
                "step": "grouped_collections",
                "nftCount": nft_count,
                "collectionCount": collection_count
            }),
        )
        .await;

        self.report(
            job,
            json!({
                "step": "fetching_collections",
                "nftCount": nft_count,
                "collectionCount": collection_count
            }),
        )
        .await;

        // All-settled fan-out: failed collections are logged and skipped,
        // never fatal to the whole valuation.
        let fetches = groups.values().map(|group| {
            let aggregator = Arc::clone(&self.aggregator);
            let gate = self.gate.clone();
            let slug = group.slug.clone();
            let contract = group.contract_address.clone();
            async move {
                let _permit = gate.acquire().await;
                let result = aggregator.fetch_collection_data(&slug, &contract).await;
                (slug, result)
            }
        });
        let settled = join_all(fetches).await;

        let mut fetched: BTreeMap<String, crate::models::CollectionData> = BTreeMap::new();
        for (slug, result) in settled {
            match result {
                Ok(data) => {
                    fetched.insert(slug, data);
                }
                Err(e) => {
                    warn!(slug = %slug, error = %e, "Collection skipped in valuation");
                }
            }
        }
        self.report(
            job,
            json!({
                "step": "fetched_collections",
                "nftCount": nft_count,
                "collectionCount": collection_count,
                "processedCollections": fetched.len()
            }),
        )
        .await;

        let mut breakdown: Vec<CollectionHolding> = Vec::new();
        let mut total_value_eth = 0.0;
        for group in groups.values() {
            let data = match fetched.get(&group.slug) {
                Some(data) => data,
                None => continue,
            };
            let value_eth = data.floor_price_eth * group.nft_count as f64;
            total_value_eth += value_eth;
            breakdown.push(CollectionHolding {
                slug: group.slug.clone(),
                contract_address: group.contract_address.clone(),
                name: data.name.clone(),
                image_url: data.image_url.clone(),
                safelist_status: data.safelist_status.clone(),
                nft_count: group.nft_count,
                floor_price_eth: data.floor_price_eth,
                total_value_eth: value_eth,
                floor_price_usd: eth_price_usd.map(|p| data.floor_price_eth * p),
                total_value_usd: eth_price_usd.map(|p| value_eth * p),
            });
        }
        breakdown.sort_by(|a, b| {
            b.total_value_eth
                .partial_cmp(&a.total_value_eth)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.slug.cmp(&b.slug))
        });

        let summary = PortfolioSummary {
            total_value_eth,
            total_value_usd: eth_price_usd.map(|p| total_value_eth * p),
            nft_count,
            collection_count,
            breakdown,
            calculated_at: Utc::now().to_rfc3339(),
            eth_price_usd,
        };
        self.write_summary(&address, &summary).await?;

        self.report(
            job,
            json!({
                "step": "completed",
                "nftCount": nft_count,
                "collectionCount": collection_count,
                "processedCollections": fetched.len()
            }),
        )
        .await;
        info!(
            account = %address,
            total_eth = summary.total_value_eth,
            collections = collection_count,
            "Portfolio calculated"
        );
        Ok(Some(json!({
            "totalValueEth": summary.total_value_eth,
            "nftCount": nft_count,
            "collectionCount": collection_count
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::worker::process_next;
    use crate::queue::{portfolio_job_options, JobState, PORTFOLIO_QUEUE};
    use crate::store::CollectionStore;
    use crate::testutil::{
        collection, FakeFloorProvider, FakeMarketplace, MemoryCache, MemoryCollectionStore,
        MemoryQueue,
    };
    use crate::upstream::opensea::NftsPage;
    use crate::upstream::{MarketplaceFloor, UpstreamError};

    const ADDR: &str = "0x0000000000000000000000000000000000000001";
    const CONTRACT_A: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const CONTRACT_B: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn nft(identifier: &str, collection: &str, contract: &str) -> WalletNft {
        WalletNft {
            identifier: identifier.to_string(),
            collection: collection.to_string(),
            contract: contract.to_string(),
            name: None,
            image_url: None,
        }
    }

    struct Setup {
        marketplace: Arc<FakeMarketplace>,
        floor: Arc<FakeFloorProvider>,
        cache: Arc<MemoryCache>,
        queue: Arc<MemoryQueue>,
        quotes: QuoteCache,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                marketplace: Arc::new(FakeMarketplace::new()),
                floor: Arc::new(FakeFloorProvider::new()),
                cache: Arc::new(MemoryCache::new()),
                queue: Arc::new(MemoryQueue::new()),
                quotes: QuoteCache::new(),
            }
        }

        fn handler(&self) -> Arc<dyn JobHandler> {
            let retry = RetryPolicy::new(2, Duration::from_millis(50), Duration::from_secs(1));
            let aggregator = Arc::new(CollectionAggregator::new(
                Arc::clone(&self.marketplace) as Arc<dyn MarketplaceApi>,
                Arc::clone(&self.floor) as _,
                Arc::new(MemoryCollectionStore::new()) as Arc<dyn CollectionStore>,
                retry,
                Gate::new(5),
            ));
            Arc::new(PortfolioHandler::new(
                Arc::clone(&self.marketplace) as _,
                aggregator,
                Arc::clone(&self.cache) as _,
                Arc::clone(&self.queue) as Arc<dyn JobQueue>,
                self.quotes.clone(),
                10,
                retry,
                50,
                200,
                Duration::from_secs(14_400),
            ))
        }

        async fn enqueue_and_run(&self) -> bool {
            let queue: Arc<dyn JobQueue> = Arc::clone(&self.queue) as _;
            queue
                .add(
                    PORTFOLIO_QUEUE,
                    ADDR,
                    json!({"address": ADDR}),
                    &portfolio_job_options(),
                )
                .await
                .unwrap();
            process_next(&queue, PORTFOLIO_QUEUE, &self.handler())
                .await
                .unwrap()
        }

        async fn cached_summary(&self) -> PortfolioSummary {
            let payload = self
                .cache
                .get(&cache_keys::portfolio_summary(ADDR))
                .await
                .unwrap()
                .expect("summary cached");
            serde_json::from_str(&payload).unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_wallet_writes_zero_summary() {
        let setup = Setup::new();
        setup.marketplace.script_nfts(vec![Ok(NftsPage {
            nfts: vec![],
            next_cursor: None,
        })]);

        assert!(setup.enqueue_and_run().await);

        let summary = setup.cached_summary().await;
        assert_eq!(summary.total_value_eth, 0.0);
        assert_eq!(summary.total_value_usd, Some(0.0));
        assert_eq!(summary.nft_count, 0);
        assert_eq!(summary.collection_count, 0);
        assert!(summary.breakdown.is_empty());
        // No price snapshot yet: the summary pins 0 rather than omitting.
        assert_eq!(summary.eth_price_usd, Some(0.0));

        assert_eq!(
            setup.queue.job_state(PORTFOLIO_QUEUE, ADDR),
            Some(JobState::Completed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_failures_skip_broken_collections() {
        let setup = Setup::new();
        setup.marketplace.script_nfts(vec![Ok(NftsPage {
            nfts: vec![
                nft("1", "col-a", CONTRACT_A),
                nft("2", "col-a", CONTRACT_A),
                nft("3", "col-b", CONTRACT_B),
            ],
            next_cursor: None,
        })]);
        setup
            .marketplace
            .script_collection_info("col-a", vec![Ok(collection("col-a", "Col A", 100))]);
        setup.floor.set(
            CONTRACT_A,
            Ok(vec![MarketplaceFloor {
                marketplace: "opensea".into(),
                floor_price_eth: 1.0,
            }]),
        );
        // Collection B's provider is down for good.
        setup.marketplace.script_collection_info(
            "col-b",
            vec![Err(UpstreamError::Transient("502".into()))],
        );
        setup
            .floor
            .set(CONTRACT_B, Err(UpstreamError::Transient("502".into())));

        assert!(setup.enqueue_and_run().await);

        let summary = setup.cached_summary().await;
        assert_eq!(summary.total_value_eth, 2.0);
        assert_eq!(summary.nft_count, 3);
        assert_eq!(summary.collection_count, 2);
        assert_eq!(summary.breakdown.len(), 1);
        assert_eq!(summary.breakdown[0].slug, "col-a");
        assert_eq!(summary.breakdown[0].nft_count, 2);

        // Skipped collections do not fail the job.
        assert_eq!(
            setup.queue.job_state(PORTFOLIO_QUEUE, ADDR),
            Some(JobState::Completed)
        );
        let job = setup
            .queue
            .get_job(PORTFOLIO_QUEUE, ADDR)
            .await
            .unwrap()
            .unwrap();
        let progress = job.progress.unwrap();
        assert_eq!(progress["step"], "completed");
        assert_eq!(progress["processedCollections"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn usd_mirrors_follow_the_quote_snapshot() {
        let setup = Setup::new();
        setup.marketplace.script_nfts(vec![Ok(NftsPage {
            nfts: vec![nft("1", "col-a", CONTRACT_A)],
            next_cursor: None,
        })]);
        setup
            .marketplace
            .script_collection_info("col-a", vec![Ok(collection("col-a", "Col A", 100))]);
        setup.floor.set(
            CONTRACT_A,
            Ok(vec![MarketplaceFloor {
                marketplace: "opensea".into(),
                floor_price_eth: 2.0,
            }]),
        );
        // Seed the quote snapshot through its public surface.
        {
            use crate::upstream::PriceApi;
            struct Fixed;
            #[async_trait]
            impl PriceApi for Fixed {
                async fn eth_price(
                    &self,
                    _c: &[&str],
                ) -> Result<std::collections::HashMap<String, f64>, UpstreamError> {
                    Ok(std::collections::HashMap::from([(
                        "usd".to_string(),
                        3000.0,
                    )]))
                }
            }
            let api: Arc<dyn PriceApi> = Arc::new(Fixed);
            crate::prices::refresh_prices(&setup.quotes, &api).await;
        }

        assert!(setup.enqueue_and_run().await);

        let summary = setup.cached_summary().await;
        assert_eq!(summary.total_value_eth, 2.0);
        assert_eq!(summary.eth_price_usd, Some(3000.0));
        assert_eq!(summary.total_value_usd, Some(6000.0));
        assert_eq!(summary.breakdown[0].floor_price_usd, Some(6000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn breakdown_is_sorted_by_value_descending() {
        let setup = Setup::new();
        setup.marketplace.script_nfts(vec![Ok(NftsPage {
            nfts: vec![
                nft("1", "col-a", CONTRACT_A),
                nft("2", "col-b", CONTRACT_B),
                nft("3", "col-b", CONTRACT_B),
            ],
            next_cursor: None,
        })]);
        setup
            .marketplace
            .script_collection_info("col-a", vec![Ok(collection("col-a", "Col A", 100))]);
        setup
            .marketplace
            .script_collection_info("col-b", vec![Ok(collection("col-b", "Col B", 100))]);
        setup.floor.set(
            CONTRACT_A,
            Ok(vec![MarketplaceFloor {
                marketplace: "opensea".into(),
                floor_price_eth: 1.5,
            }]),
        );
        setup.floor.set(
            CONTRACT_B,
            Ok(vec![MarketplaceFloor {
                marketplace: "opensea".into(),
                floor_price_eth: 1.0,
            }]),
        );

        assert!(setup.enqueue_and_run().await);

        let summary = setup.cached_summary().await;
        // col-b: 2 × 1.0 = 2.0 beats col-a: 1 × 1.5.
        assert_eq!(summary.breakdown[0].slug, "col-b");
        assert_eq!(summary.breakdown[1].slug, "col-a");
        let reduced: f64 = summary.breakdown.iter().map(|h| h.total_value_eth).sum();
        assert!((summary.total_value_eth - reduced).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn nft_page_failure_fails_the_job() {
        let setup = Setup::new();
        setup
            .marketplace
            .script_nfts(vec![Err(UpstreamError::Transient("down".into()))]);

        assert!(setup.enqueue_and_run().await);

        // First attempt failed; the job is waiting for its backoff.
        assert_eq!(
            setup.queue.job_state(PORTFOLIO_QUEUE, ADDR),
            Some(JobState::Delayed)
        );
        let job = setup
            .queue
            .get_job(PORTFOLIO_QUEUE, ADDR)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.progress.unwrap()["step"], "error");
        assert!(setup
            .cache
            .get(&cache_keys::portfolio_summary(ADDR))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn listing_pages_are_cached_for_the_next_run() {
        let setup = Setup::new();
        // One scripted page; once consumed the fake returns empty pages.
        setup.marketplace.script_nfts(vec![Ok(NftsPage {
            nfts: vec![nft("1", "col-a", CONTRACT_A)],
            next_cursor: None,
        })]);
        setup
            .marketplace
            .script_collection_info("col-a", vec![Ok(collection("col-a", "Col A", 100))]);
        setup.floor.set(
            CONTRACT_A,
            Ok(vec![MarketplaceFloor {
                marketplace: "opensea".into(),
                floor_price_eth: 1.0,
            }]),
        );

        assert!(setup.enqueue_and_run().await);
        assert_eq!(setup.cached_summary().await.nft_count, 1);

        // Second calculation is fed from the nft_page cache, not the
        // (now empty) upstream script.
        assert!(setup.enqueue_and_run().await);
        assert_eq!(setup.cached_summary().await.nft_count, 1);
        assert!(setup
            .cache
            .get(&format!("nft_page:{ADDR}:start"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn multiple_pages_are_concatenated() {
        let setup = Setup::new();
        setup.marketplace.script_nfts(vec![
            Ok(NftsPage {
                nfts: vec![nft("1", "col-a", CONTRACT_A)],
                next_cursor: Some("page-2".into()),
            }),
            Ok(NftsPage {
                nfts: vec![nft("2", "col-a", CONTRACT_A)],
                next_cursor: None,
            }),
        ]);
        setup
            .marketplace
            .script_collection_info("col-a", vec![Ok(collection("col-a", "Col A", 100))]);
        setup.floor.set(
            CONTRACT_A,
            Ok(vec![MarketplaceFloor {
                marketplace: "opensea".into(),
                floor_price_eth: 1.0,
            }]),
        );

        assert!(setup.enqueue_and_run().await);

        let summary = setup.cached_summary().await;
        assert_eq!(summary.nft_count, 2);
        assert_eq!(summary.total_value_eth, 2.0);
    }
}
