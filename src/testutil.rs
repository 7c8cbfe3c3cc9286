//! Shared in-memory fakes for unit tests.

#![allow(dead_code)]

use crate::cache::{Cache, CacheError};
use crate::models::{ActivityEvent, CollectionData, CollectionMetadata};
use crate::queue::{
    retry_backoff, Job, JobOptions, JobQueue, JobState, QueueDepth, QueueError,
};
use crate::store::{CollectionStore, EventStore, StoreError, UpsertStats};
use crate::upstream::opensea::{AccountProfile, EventsPage, MarketplaceApi, NftsPage};
use crate::upstream::{FloorPriceApi, MarketplaceFloor, UpstreamError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// --- Cache ---

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    /// Open scan cursors: id → keys not yet returned. Lets a scan survive
    /// deletions mid-iteration, like the real backend.
    scans: Mutex<HashMap<u64, VecDeque<String>>>,
    next_cursor: std::sync::atomic::AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, value: &str, ttl: Duration) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    pub fn live_keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (_, exp))| *exp > now)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().unwrap();
        let (_, expires) = entries.get(key)?;
        expires.checked_duration_since(Instant::now())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>), CacheError> {
        let mut pending = if cursor == 0 {
            let now = Instant::now();
            let mut keys: Vec<String> = self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, (_, exp))| k.starts_with(prefix) && *exp > now)
                .map(|(k, _)| k.clone())
                .collect();
            keys.sort();
            VecDeque::from(keys)
        } else {
            self.scans.lock().unwrap().remove(&cursor).unwrap_or_default()
        };

        let batch: Vec<String> = pending.drain(..count.min(pending.len())).collect();
        if pending.is_empty() {
            return Ok((0, batch));
        }
        let id = self
            .next_cursor
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        self.scans.lock().unwrap().insert(id, pending);
        Ok((id, batch))
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        let mut deleted = 0;
        for key in keys {
            if entries.remove(key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

// --- Queue ---

#[derive(Default)]
struct MemoryQueueState {
    jobs: HashMap<(String, String), Job>,
    waiting: HashMap<String, VecDeque<String>>,
    delayed: HashMap<String, Vec<(String, i64)>>,
}

/// In-memory [`JobQueue`] with the same dedup semantics as the Redis one.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waiting_ids(&self, queue: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .waiting
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn job_state(&self, queue: &str, id: &str) -> Option<JobState> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .get(&(queue.to_string(), id.to_string()))
            .map(|j| j.state)
    }

    /// Promote every delayed job regardless of its timer (test shortcut).
    pub fn promote_all(&self, queue: &str) {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<String> = state
            .delayed
            .remove(queue)
            .unwrap_or_default()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            if let Some(job) = state.jobs.get_mut(&(queue.to_string(), id.clone())) {
                job.state = JobState::Waiting;
            }
            state
                .waiting
                .entry(queue.to_string())
                .or_default()
                .push_back(id);
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn add(
        &self,
        queue: &str,
        job_id: &str,
        data: Value,
        options: &JobOptions,
    ) -> Result<Job, QueueError> {
        let mut state = self.state.lock().unwrap();
        let key = (queue.to_string(), job_id.to_string());

        if let Some(existing) = state.jobs.get(&key) {
            if !existing.state.is_terminal() {
                return Ok(existing.clone());
            }
        }

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
        state.jobs.insert(key, job.clone());
        state
            .waiting
            .entry(queue.to_string())
            .or_default()
            .push_back(job_id.to_string());
        Ok(job)
    }

    async fn get_job(&self, queue: &str, job_id: &str) -> Result<Option<Job>, QueueError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .get(&(queue.to_string(), job_id.to_string()))
            .cloned())
    }

    async fn update_progress(
        &self,
        queue: &str,
        job_id: &str,
        progress: Value,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state
            .jobs
            .get_mut(&(queue.to_string(), job_id.to_string()))
        {
            job.progress = Some(progress);
        }
        Ok(())
    }

    async fn take_next(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let now = Utc::now().timestamp_millis();
        let mut state = self.state.lock().unwrap();

        let due: Vec<String> = match state.delayed.get_mut(queue) {
            Some(delayed) => {
                let due = delayed
                    .iter()
                    .filter(|(_, at)| *at <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                delayed.retain(|(_, at)| *at > now);
                due
            }
            None => Vec::new(),
        };
        for id in due {
            state
                .waiting
                .entry(queue.to_string())
                .or_default()
                .push_back(id);
        }

        let id = match state.waiting.get_mut(queue).and_then(|q| q.pop_front()) {
            Some(id) => id,
            None => return Ok(None),
        };
        let job = state
            .jobs
            .get_mut(&(queue.to_string(), id))
            .expect("waiting id has a job");
        job.attempts_made += 1;
        job.state = JobState::Active;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, job: &Job, result: Option<Value>) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if let Some(stored) = state
            .jobs
            .get_mut(&(job.queue.clone(), job.id.clone()))
        {
            stored.state = JobState::Completed;
            stored.result = result;
            stored.finished_at_ms = Some(Utc::now().timestamp_millis());
        }
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        let key = (job.queue.clone(), job.id.clone());
        let retry = job.attempts_made < job.options.attempts;
        if let Some(stored) = state.jobs.get_mut(&key) {
            stored.last_error = Some(error.to_string());
            if retry {
                stored.state = JobState::Delayed;
            } else {
                stored.state = JobState::Failed;
                stored.finished_at_ms = Some(Utc::now().timestamp_millis());
            }
        }
        if retry {
            let delay = retry_backoff(&job.options, job.attempts_made);
            let at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            state
                .delayed
                .entry(job.queue.clone())
                .or_default()
                .push((job.id.clone(), at));
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, QueueError> {
        let state = self.state.lock().unwrap();
        Ok(QueueDepth {
            waiting: state.waiting.get(queue).map(|q| q.len()).unwrap_or(0) as u64,
            delayed: state.delayed.get(queue).map(|d| d.len()).unwrap_or(0) as u64,
        })
    }
}

// --- Stores ---

#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<HashMap<(String, String, String), ActivityEvent>>,
    pub fail_reads: Mutex<bool>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn touching(&self, address: &str) -> Vec<ActivityEvent> {
        let mut events: Vec<ActivityEvent> = self
            .events
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.from_account.address == address || e.to_account.address == address)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_date.cmp(&a.created_date));
        events
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn latest_event_for_account(
        &self,
        address: &str,
    ) -> Result<Option<ActivityEvent>, StoreError> {
        if *self.fail_reads.lock().unwrap() {
            return Err(StoreError("injected read failure".into()));
        }
        Ok(self.touching(address).into_iter().next())
    }

    async fn count_events_for_account(&self, address: &str) -> Result<i64, StoreError> {
        Ok(self.touching(address).len() as i64)
    }

    async fn events_for_account_paginated(
        &self,
        address: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ActivityEvent>, StoreError> {
        Ok(self
            .touching(address)
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn bulk_upsert_events(&self, events: &[ActivityEvent]) -> Result<UpsertStats, StoreError> {
        let mut stored = self.events.lock().unwrap();
        let mut stats = UpsertStats::default();
        for event in events {
            let key = (
                event.transaction.clone(),
                event.event_type.as_str().to_string(),
                event.nft.identifier.clone(),
            );
            if stored.contains_key(&key) {
                stats.duplicates += 1;
            } else {
                stored.insert(key, event.clone());
                stats.inserted += 1;
            }
        }
        Ok(stats)
    }
}

#[derive(Default)]
pub struct MemoryCollectionStore {
    rows: Mutex<HashMap<String, CollectionMetadata>>,
}

impl MemoryCollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_fresh(&self, data: CollectionData) {
        let now = Utc::now();
        self.rows.lock().unwrap().insert(
            data.slug.clone(),
            CollectionMetadata {
                data,
                data_last_fetched_at: now,
                updated_at: now,
            },
        );
    }

    pub fn get(&self, slug: &str) -> Option<CollectionMetadata> {
        self.rows.lock().unwrap().get(slug).cloned()
    }
}

#[async_trait]
impl CollectionStore for MemoryCollectionStore {
    async fn find_collection_metadata(
        &self,
        slug: &str,
    ) -> Result<Option<CollectionMetadata>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::seconds(86_400);
        Ok(rows
            .get(slug)
            .filter(|row| row.updated_at > cutoff)
            .cloned())
    }

    async fn upsert_collection_metadata(&self, data: &CollectionData) -> Result<(), StoreError> {
        self.insert_fresh(data.clone());
        Ok(())
    }
}

// --- Upstream fakes ---

type UpstreamResult<T> = Result<T, UpstreamError>;

/// Scripted marketplace fake. Responses are consumed per call; when a
/// script runs dry the last configured answer repeats.
#[derive(Default)]
pub struct FakeMarketplace {
    pub collection_info: Mutex<HashMap<String, VecDeque<UpstreamResult<CollectionData>>>>,
    pub best_listing: Mutex<HashMap<String, UpstreamResult<Option<f64>>>>,
    pub events_pages: Mutex<VecDeque<UpstreamResult<EventsPage>>>,
    pub nfts_pages: Mutex<VecDeque<UpstreamResult<NftsPage>>>,
    pub profiles: Mutex<HashMap<String, UpstreamResult<Option<AccountProfile>>>>,
    pub collection_info_calls: Mutex<u32>,
    pub events_calls: Mutex<Vec<(Option<String>, Option<i64>)>>,
}

impl FakeMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_collection_info(
        &self,
        slug: &str,
        responses: Vec<UpstreamResult<CollectionData>>,
    ) {
        self.collection_info
            .lock()
            .unwrap()
            .insert(slug.to_string(), responses.into());
    }

    pub fn script_events(&self, pages: Vec<UpstreamResult<EventsPage>>) {
        *self.events_pages.lock().unwrap() = pages.into();
    }

    pub fn script_nfts(&self, pages: Vec<UpstreamResult<NftsPage>>) {
        *self.nfts_pages.lock().unwrap() = pages.into();
    }
}

#[async_trait]
impl MarketplaceApi for FakeMarketplace {
    async fn collection_info(&self, slug: &str) -> UpstreamResult<CollectionData> {
        *self.collection_info_calls.lock().unwrap() += 1;
        let mut scripts = self.collection_info.lock().unwrap();
        match scripts.get_mut(slug) {
            Some(queue) => {
                if queue.len() > 1 {
                    queue.pop_front().expect("non-empty")
                } else {
                    queue.front().cloned().unwrap_or(Err(UpstreamError::NotFound))
                }
            }
            None => Err(UpstreamError::NotFound),
        }
    }

    async fn best_listing_floor(&self, slug: &str) -> UpstreamResult<Option<f64>> {
        self.best_listing
            .lock()
            .unwrap()
            .get(slug)
            .cloned()
            .unwrap_or(Ok(None))
    }

    async fn account_events_page(
        &self,
        _address: &str,
        cursor: Option<&str>,
        occurred_after: Option<i64>,
        _limit: u32,
    ) -> UpstreamResult<EventsPage> {
        self.events_calls
            .lock()
            .unwrap()
            .push((cursor.map(String::from), occurred_after));
        self.events_pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(EventsPage {
                    events: Vec::new(),
                    next_cursor: None,
                    raw_count: 0,
                })
            })
    }

    async fn account_nfts_page(
        &self,
        _address: &str,
        _cursor: Option<&str>,
        _limit: u32,
    ) -> UpstreamResult<NftsPage> {
        self.nfts_pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(NftsPage {
                    nfts: Vec::new(),
                    next_cursor: None,
                })
            })
    }

    async fn account_profile(&self, account: &str) -> UpstreamResult<Option<AccountProfile>> {
        self.profiles
            .lock()
            .unwrap()
            .get(account)
            .cloned()
            .unwrap_or(Ok(None))
    }
}

/// Fixed floor-price fake keyed by contract.
#[derive(Default)]
pub struct FakeFloorProvider {
    pub floors: Mutex<HashMap<String, UpstreamResult<Vec<MarketplaceFloor>>>>,
}

impl FakeFloorProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, contract: &str, result: UpstreamResult<Vec<MarketplaceFloor>>) {
        self.floors
            .lock()
            .unwrap()
            .insert(contract.to_string(), result);
    }
}

#[async_trait]
impl FloorPriceApi for FakeFloorProvider {
    async fn floor_prices(&self, contract: &str) -> UpstreamResult<Vec<MarketplaceFloor>> {
        self.floors
            .lock()
            .unwrap()
            .get(contract)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Fixed fiat-price fake.
pub struct StaticPriceApi(pub Option<f64>);

#[async_trait]
impl crate::upstream::PriceApi for StaticPriceApi {
    async fn eth_price(
        &self,
        _currencies: &[&str],
    ) -> UpstreamResult<HashMap<String, f64>> {
        match self.0 {
            Some(usd) => Ok(HashMap::from([("usd".to_string(), usd)])),
            None => Err(UpstreamError::Transient("price provider down".into())),
        }
    }
}

/// Fixed gas-price fake (wei).
pub struct StaticGasApi(pub Option<u128>);

#[async_trait]
impl crate::upstream::GasApi for StaticGasApi {
    async fn gas_price_wei(&self) -> UpstreamResult<u128> {
        match self.0 {
            Some(wei) => Ok(wei),
            None => Err(UpstreamError::Transient("rpc down".into())),
        }
    }
}

// --- Full application state over fakes ---

pub struct TestState {
    pub state: Arc<crate::state::AppState>,
    pub cache: Arc<MemoryCache>,
    pub queue: Arc<MemoryQueue>,
    pub events: Arc<MemoryEventStore>,
    pub collection_store: Arc<MemoryCollectionStore>,
    pub marketplace: Arc<FakeMarketplace>,
    pub floor: Arc<FakeFloorProvider>,
}

/// An [`AppState`](crate::state::AppState) wired entirely over in-memory
/// fakes, for HTTP-level tests.
pub fn test_state() -> TestState {
    use crate::aggregator::CollectionAggregator;
    use crate::collections::CollectionService;
    use crate::config::Config;
    use crate::gate::Gate;
    use crate::lookups::LookupService;
    use crate::prices::QuoteCache;
    use crate::retry::RetryPolicy;
    use crate::state::AppState;
    use crate::workers::AccountSyncService;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    let config = Config::default();
    let cache = Arc::new(MemoryCache::new());
    let queue = Arc::new(MemoryQueue::new());
    let events = Arc::new(MemoryEventStore::new());
    let collection_store = Arc::new(MemoryCollectionStore::new());
    let marketplace = Arc::new(FakeMarketplace::new());
    let floor = Arc::new(FakeFloorProvider::new());

    let retry = RetryPolicy::new(
        2,
        Duration::from_millis(50),
        Duration::from_millis(500),
    );
    let aggregator = Arc::new(CollectionAggregator::new(
        Arc::clone(&marketplace) as _,
        Arc::clone(&floor) as _,
        Arc::clone(&collection_store) as _,
        retry,
        Gate::new(config.max_concurrent_os_requests),
    ));
    let collections = CollectionService::new(
        Arc::clone(&cache) as _,
        Arc::clone(&queue) as _,
    );
    let sync = Arc::new(AccountSyncService::new(
        Arc::clone(&marketplace) as _,
        Arc::clone(&events) as _,
        config.max_pages_default,
        config.opensea_limit,
        Duration::from_millis(1),
    ));
    let lookups = LookupService::new(
        Arc::clone(&cache) as _,
        Arc::clone(&marketplace) as _,
        config.ens_ttl(),
        config.user_ttl(),
    );

    let state = Arc::new(AppState {
        config,
        cache: Arc::clone(&cache) as _,
        events: Arc::clone(&events) as _,
        collection_store: Arc::clone(&collection_store) as _,
        queue: Arc::clone(&queue) as _,
        marketplace: Arc::clone(&marketplace) as _,
        floor_provider: Arc::clone(&floor) as _,
        price_api: Arc::new(StaticPriceApi(Some(3000.0))),
        gas_api: Arc::new(StaticGasApi(Some(25_000_000_000))),
        aggregator,
        collections,
        sync,
        lookups,
        quotes: QuoteCache::new(),
        start_time: Instant::now(),
        request_count: AtomicU64::new(0),
    });

    TestState {
        state,
        cache,
        queue,
        events,
        collection_store,
        marketplace,
        floor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_never_served() {
        let cache = MemoryCache::new();
        cache.insert("collection:azuki", "{}", Duration::from_secs(60));
        assert!(cache.get("collection:azuki").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("collection:azuki").await.unwrap().is_none());
        assert!(cache.live_keys().is_empty());
    }

    #[tokio::test]
    async fn queue_add_deduplicates_non_terminal_jobs() {
        let queue = MemoryQueue::new();
        let opts = crate::queue::collection_job_options();

        let first = queue
            .add("q", "azuki", Value::Null, &opts)
            .await
            .unwrap();
        let second = queue
            .add("q", "azuki", Value::Null, &opts)
            .await
            .unwrap();
        assert_eq!(first.enqueued_at_ms, second.enqueued_at_ms);
        assert_eq!(queue.waiting_ids("q"), vec!["azuki"]);

        // Terminal jobs are replaced on re-add.
        let taken = queue.take_next("q").await.unwrap().unwrap();
        queue.complete(&taken, None).await.unwrap();
        queue
            .add("q", "azuki", Value::Null, &opts)
            .await
            .unwrap();
        assert_eq!(queue.job_state("q", "azuki"), Some(JobState::Waiting));
    }
}

// --- Builders ---

pub fn collection(slug: &str, name: &str, supply: i64) -> CollectionData {
    CollectionData {
        slug: slug.to_string(),
        name: Some(name.to_string()),
        description: None,
        image_url: Some(format!("https://img/{slug}.png")),
        safelist_status: Some("verified".to_string()),
        total_supply: supply,
        num_owners: supply / 2,
        total_volume: 1.0,
        market_cap: 2.0,
        floor_price_eth: 0.0,
    }
}

pub fn sale_event(tx: &str, identifier: &str, created_ms: i64, address: &str) -> ActivityEvent {
    use crate::models::{EventAccount, EventNft, EventPayment, EventType};
    ActivityEvent {
        event_type: EventType::Sale,
        created_date: created_ms,
        transaction: tx.to_string(),
        nft: EventNft {
            identifier: identifier.to_string(),
            collection: "azuki".to_string(),
            contract: "0x3333333333333333333333333333333333333333".to_string(),
            display_image_url: String::new(),
            image_url: String::new(),
            name: None,
        },
        payment: Some(EventPayment {
            quantity: "1000000000000000000".to_string(),
            token_address: crate::models::ZERO_ADDRESS.to_string(),
            decimals: "18".to_string(),
            symbol: "ETH".to_string(),
        }),
        from_account: EventAccount {
            address: address.to_string(),
            user: None,
        },
        to_account: EventAccount {
            address: "0x2222222222222222222222222222222222222222".to_string(),
            user: None,
        },
        quantity: 1,
    }
}
