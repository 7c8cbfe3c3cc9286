//! Application state shared across handlers and workers.

use crate::aggregator::CollectionAggregator;
use crate::cache::{Cache, RedisCache};
use crate::collections::CollectionService;
use crate::config::Config;
use crate::error::Error;
use crate::gate::Gate;
use crate::lookups::LookupService;
use crate::prices::{run_gas_poller, run_price_poller, QuoteCache};
use crate::queue::redis::RedisJobQueue;
use crate::queue::{run_worker, JobHandler, JobQueue, WorkerOptions, COLLECTION_QUEUE, PORTFOLIO_QUEUE};
use crate::retry::RetryPolicy;
use crate::store::{CollectionStore, EventStore, PgStore};
use crate::upstream::opensea::MarketplaceApi;
use crate::upstream::{
    EthRpcClient, FloorPriceApi, GasApi, NftGoClient, OpenSeaClient, PriceApi, PriceQuoteClient,
};
use crate::workers::{AccountSyncService, CollectionRefreshHandler, PortfolioHandler};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Connections held by the record store pool.
const DB_POOL_SIZE: u32 = 20;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub cache: Arc<dyn Cache>,
    pub events: Arc<dyn EventStore>,
    pub collection_store: Arc<dyn CollectionStore>,
    pub queue: Arc<dyn JobQueue>,
    pub marketplace: Arc<dyn MarketplaceApi>,
    pub floor_provider: Arc<dyn FloorPriceApi>,
    pub price_api: Arc<dyn PriceApi>,
    pub gas_api: Arc<dyn GasApi>,
    pub aggregator: Arc<CollectionAggregator>,
    pub collections: CollectionService,
    pub sync: Arc<AccountSyncService>,
    pub lookups: LookupService,
    pub quotes: QuoteCache,
    pub start_time: Instant,
    pub request_count: AtomicU64,
}

impl AppState {
    /// Connect every backend and wire the service graph.
    pub async fn new(config: Config) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;

        let cache: Arc<dyn Cache> = Arc::new(
            RedisCache::connect(&config.redis_url)
                .await
                .map_err(|e| Error::Config(format!("redis: {e}")))?,
        );
        let queue: Arc<dyn JobQueue> = Arc::new(
            RedisJobQueue::connect(&config.redis_url)
                .await
                .map_err(|e| Error::Config(format!("redis queue: {e}")))?,
        );

        let store = PgStore::connect(&config.database_url, DB_POOL_SIZE)
            .await
            .map_err(|e| Error::Config(format!("postgres: {e}")))?;
        store
            .run_migrations()
            .await
            .map_err(|e| Error::Config(format!("migrations: {e}")))?;
        let events: Arc<dyn EventStore> = Arc::new(store.clone());
        let collection_store: Arc<dyn CollectionStore> = Arc::new(store);

        let marketplace: Arc<dyn MarketplaceApi> = Arc::new(OpenSeaClient::new(
            http.clone(),
            config.opensea_base_url.clone(),
            config.opensea_api_key.clone(),
            config.fetch_timeout(),
            config.events_timeout(),
            config.nft_timeout(),
        ));
        let floor_provider: Arc<dyn FloorPriceApi> = Arc::new(NftGoClient::new(
            http.clone(),
            config.nftgo_base_url.clone(),
            config.nftgo_api_key.clone(),
            config.fetch_timeout(),
        ));
        let price_api: Arc<dyn PriceApi> = Arc::new(PriceQuoteClient::new(
            http.clone(),
            config.price_api_base_url.clone(),
            config.fetch_timeout(),
        ));
        let gas_api: Arc<dyn GasApi> = Arc::new(EthRpcClient::new(
            http,
            config.rpc_url.clone(),
            config.fetch_timeout(),
        ));

        let retry = RetryPolicy::new(
            config.max_retries,
            Duration::from_millis(config.initial_retry_delay_ms),
            Duration::from_millis(config.max_retry_delay_ms),
        );
        let aggregator = Arc::new(CollectionAggregator::new(
            Arc::clone(&marketplace),
            Arc::clone(&floor_provider),
            Arc::clone(&collection_store),
            retry,
            Gate::new(config.max_concurrent_os_requests),
        ));

        let collections = CollectionService::new(Arc::clone(&cache), Arc::clone(&queue));
        let sync = Arc::new(AccountSyncService::new(
            Arc::clone(&marketplace),
            Arc::clone(&events),
            config.max_pages_default,
            config.opensea_limit,
            config.inter_page_delay(),
        ));
        let lookups = LookupService::new(
            Arc::clone(&cache),
            Arc::clone(&marketplace),
            config.ens_ttl(),
            config.user_ttl(),
        );

        info!(
            redis = %config.redis_url,
            bind = %config.bind_address,
            "Gateway state initialized"
        );

        Ok(Self {
            config,
            cache,
            events,
            collection_store,
            queue,
            marketplace,
            floor_provider,
            price_api,
            gas_api,
            aggregator,
            collections,
            sync,
            lookups,
            quotes: QuoteCache::new(),
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
        })
    }

    /// Spawn the queue workers and the quote pollers.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let worker_options = WorkerOptions {
            concurrency: self.config.worker_concurrency,
            ..WorkerOptions::default()
        };

        let refresh_handler: Arc<dyn JobHandler> = Arc::new(CollectionRefreshHandler::new(
            Arc::clone(&self.aggregator),
            Arc::clone(&self.cache),
            Arc::clone(&self.collection_store),
            self.config.collection_ttl(),
        ));
        tokio::spawn(run_worker(
            Arc::clone(&self.queue),
            COLLECTION_QUEUE,
            refresh_handler,
            worker_options,
        ));

        let retry = RetryPolicy::new(
            self.config.max_retries,
            Duration::from_millis(self.config.initial_retry_delay_ms),
            Duration::from_millis(self.config.max_retry_delay_ms),
        );
        let portfolio_handler: Arc<dyn JobHandler> = Arc::new(PortfolioHandler::new(
            Arc::clone(&self.marketplace),
            Arc::clone(&self.aggregator),
            Arc::clone(&self.cache),
            Arc::clone(&self.queue),
            self.quotes.clone(),
            self.config.max_concurrent_collection_fetch,
            retry,
            self.config.nft_max_pages,
            crate::workers::portfolio::NFT_PAGE_LIMIT,
            self.config.portfolio_ttl(),
        ));
        tokio::spawn(run_worker(
            Arc::clone(&self.queue),
            PORTFOLIO_QUEUE,
            portfolio_handler,
            worker_options,
        ));

        tokio::spawn(run_price_poller(
            self.quotes.clone(),
            Arc::clone(&self.price_api),
            Duration::from_secs(self.config.price_poll_interval_secs),
        ));
        tokio::spawn(run_gas_poller(
            self.quotes.clone(),
            Arc::clone(&self.gas_api),
            Duration::from_secs(self.config.gas_poll_interval_secs),
        ));

        info!("Background workers and pollers spawned");
    }
}
