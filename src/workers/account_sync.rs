//! Account events sync worker: cursor + after-timestamp incremental
//! pull from the marketplace timeline into the record store.
//!
//! A process-wide lock set keyed by lower-case address keeps two syncs for
//! the same account from running at once; the guard releases on every exit
//! path, including panics and cancellation.

use crate::error::Error;
use crate::models::normalize_address;
use crate::retry::{with_retry, RetryPolicy};
use crate::store::EventStore;
use crate::upstream::opensea::MarketplaceApi;
use crate::upstream::UpstreamError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Upstream attempts per page.
const PAGE_MAX_ATTEMPTS: u32 = 5;
/// Base backoff between page attempts.
const PAGE_RETRY_BASE: Duration = Duration::from_secs(5);
/// Ceiling on a single page backoff.
const PAGE_RETRY_MAX: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pages: u32,
    /// Raw events received before mapping filtered any out.
    pub fetched: usize,
    pub upserted: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another sync for this address holds the lock; nothing was fetched.
    AlreadySyncing,
    Completed(SyncReport),
}

type LockSet = Arc<Mutex<HashSet<String>>>;

/// Removes the address from the lock set on drop.
struct SyncGuard {
    locks: LockSet,
    address: String,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.locks.lock().unwrap().remove(&self.address);
    }
}

pub struct AccountSyncService {
    marketplace: Arc<dyn MarketplaceApi>,
    events: Arc<dyn EventStore>,
    locks: LockSet,
    max_pages: u32,
    page_limit: u32,
    inter_page_delay: Duration,
    retry: RetryPolicy,
}

impl AccountSyncService {
    pub fn new(
        marketplace: Arc<dyn MarketplaceApi>,
        events: Arc<dyn EventStore>,
        max_pages: u32,
        page_limit: u32,
        inter_page_delay: Duration,
    ) -> Self {
        Self {
            marketplace,
            events,
            locks: Arc::new(Mutex::new(HashSet::new())),
            max_pages,
            page_limit,
            inter_page_delay,
            retry: RetryPolicy::new(PAGE_MAX_ATTEMPTS, PAGE_RETRY_BASE, PAGE_RETRY_MAX),
        }
    }

    /// Whether a sync currently holds the lock for this address.
    pub fn is_syncing(&self, address: &str) -> bool {
        let address = address.to_ascii_lowercase();
        self.locks.lock().unwrap().contains(&address)
    }

    fn acquire_lock(&self, address: &str) -> Option<SyncGuard> {
        let mut locks = self.locks.lock().unwrap();
        if !locks.insert(address.to_string()) {
            return None;
        }
        Some(SyncGuard {
            locks: Arc::clone(&self.locks),
            address: address.to_string(),
        })
    }

    /// Run one incremental sync. Returns without touching the upstream
    /// when the address is already being synced.
    pub async fn sync_account(&self, address: &str) -> Result<SyncOutcome, Error> {
        let address = normalize_address(address)
            .ok_or_else(|| Error::InvalidInput(format!("bad address: {address}")))?;

        let _guard = match self.acquire_lock(&address) {
            Some(guard) => guard,
            None => return Ok(SyncOutcome::AlreadySyncing),
        };

        // Incremental window: everything strictly after the newest stored
        // event, in seconds for the upstream query.
        let occurred_after = self
            .events
            .latest_event_for_account(&address)
            .await
            .map_err(|e| Error::Store(e.to_string()))?
            .map(|latest| latest.created_date / 1000);

        let mut report = SyncReport::default();
        let mut cursor: Option<String> = None;

        while report.pages < self.max_pages {
            let marketplace = Arc::clone(&self.marketplace);
            let page_result = with_retry(&self.retry, "account-events", |_| {
                let marketplace = Arc::clone(&marketplace);
                let address = address.clone();
                let cursor = cursor.clone();
                let after = if cursor.is_none() { occurred_after } else { None };
                let limit = self.page_limit;
                async move {
                    marketplace
                        .account_events_page(&address, cursor.as_deref(), after, limit)
                        .await
                }
            })
            .await;

            let page = match page_result {
                Ok(page) => page,
                // Retries exhausted on a retryable class: keep what we
                // have, the next sync picks up from the stored cursor
                // position via occurred_after.
                Err(e) if e.is_retryable() => {
                    warn!(account = %address, page = report.pages, error = %e, "Page retries exhausted, ending sync");
                    break;
                }
                Err(UpstreamError::NotFound) => break,
                Err(e) => {
                    return Err(Error::Upstream(format!(
                        "event sync for {address}: {e}"
                    )));
                }
            };

            report.pages += 1;
            report.fetched += page.raw_count;

            let mut events = page.events;
            events.sort_by(|a, b| b.created_date.cmp(&a.created_date));
            if !events.is_empty() {
                let stats = self
                    .events
                    .bulk_upsert_events(&events)
                    .await
                    .map_err(|e| Error::Store(e.to_string()))?;
                report.upserted += stats.inserted;
                report.duplicates += stats.duplicates;
                if stats.duplicates > 0 {
                    warn!(
                        account = %address,
                        duplicates = stats.duplicates,
                        "Duplicate events skipped during upsert"
                    );
                }
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
            tokio::time::sleep(self.inter_page_delay).await;
        }

        info!(
            account = %address,
            pages = report.pages,
            upserted = report.upserted,
            duplicates = report.duplicates,
            "Account sync finished"
        );
        Ok(SyncOutcome::Completed(report))
    }
}
