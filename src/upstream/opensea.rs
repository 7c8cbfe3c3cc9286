//! Marketplace API client: collection metadata, best listings, account
//! event timelines, wallet NFT listings and account profiles.
//!
//! The event mapping enforces the activity-event invariants; a raw event
//! that cannot be normalized is filtered (logged, not an error).

use crate::models::{
    normalize_address, ActivityEvent, CollectionData, EventAccount, EventNft, EventPayment,
    EventType, WalletNft, ZERO_ADDRESS,
};
use crate::upstream::{send_json, UpstreamError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// One page of normalized account events.
#[derive(Debug, Clone)]
pub struct EventsPage {
    pub events: Vec<ActivityEvent>,
    pub next_cursor: Option<String>,
    /// Raw events received before mapping filtered any out.
    pub raw_count: usize,
}

/// One page of wallet NFTs.
#[derive(Debug, Clone)]
pub struct NftsPage {
    pub nfts: Vec<WalletNft>,
    pub next_cursor: Option<String>,
}

/// Marketplace account record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountProfile {
    pub address: String,
    pub username: Option<String>,
}

/// Typed surface of the marketplace provider.
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    /// `GET /collections/{slug}`, stats flattened. 404 surfaces as
    /// [`UpstreamError::NotFound`]; the caller picks the domain default.
    async fn collection_info(&self, slug: &str) -> Result<CollectionData, UpstreamError>;

    /// Best-listing floor for a collection in ETH. `Ok(None)` means no
    /// active listings (including upstream 404).
    async fn best_listing_floor(&self, slug: &str) -> Result<Option<f64>, UpstreamError>;

    /// One page of the account event timeline, normalized and filtered.
    async fn account_events_page(
        &self,
        address: &str,
        cursor: Option<&str>,
        occurred_after: Option<i64>,
        limit: u32,
    ) -> Result<EventsPage, UpstreamError>;

    /// One page of the wallet NFT listing.
    async fn account_nfts_page(
        &self,
        address: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<NftsPage, UpstreamError>;

    /// Account profile by address or name. `Ok(None)` when unknown.
    async fn account_profile(&self, account: &str) -> Result<Option<AccountProfile>, UpstreamError>;
}

pub struct OpenSeaClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    fetch_timeout: Duration,
    events_timeout: Duration,
    nft_timeout: Duration,
}

impl OpenSeaClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        fetch_timeout: Duration,
        events_timeout: Duration,
        nft_timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            fetch_timeout,
            events_timeout,
            nft_timeout,
        }
    }

    fn get(&self, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{path}", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("accept", "application/json")
            .timeout(timeout)
    }
}

#[async_trait]
impl MarketplaceApi for OpenSeaClient {
    async fn collection_info(&self, slug: &str) -> Result<CollectionData, UpstreamError> {
        let raw: RawCollection = send_json(
            self.get(&format!("/collections/{slug}"), self.fetch_timeout),
        )
        .await?;
        Ok(raw.flatten(slug))
    }

    async fn best_listing_floor(&self, slug: &str) -> Result<Option<f64>, UpstreamError> {
        let result: Result<RawBestListings, UpstreamError> = send_json(
            self.get(
                &format!("/listings/collection/{slug}/best"),
                self.fetch_timeout,
            ),
        )
        .await;

        match result {
            Ok(body) => Ok(body
                .listings
                .iter()
                .find_map(|listing| listing.price_eth())),
            // No listings for the collection.
            Err(UpstreamError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn account_events_page(
        &self,
        address: &str,
        cursor: Option<&str>,
        occurred_after: Option<i64>,
        limit: u32,
    ) -> Result<EventsPage, UpstreamError> {
        let mut request = self
            .get(&format!("/events/accounts/{address}"), self.events_timeout)
            .query(&[("chain", "ethereum")])
            .query(&[("limit", limit.to_string())])
            .query(&[
                ("event_type", "sale"),
                ("event_type", "transfer"),
                ("event_type", "cancel"),
            ]);
        if let Some(next) = cursor {
            request = request.query(&[("next", next)]);
        } else if let Some(after) = occurred_after {
            request = request.query(&[("occurred_after", after.to_string())]);
        }

        let raw: RawEventsResponse = send_json(request).await?;
        let raw_count = raw.asset_events.len();
        let events: Vec<ActivityEvent> = raw
            .asset_events
            .iter()
            .filter_map(|e| {
                let mapped = map_raw_event(e);
                if mapped.is_none() {
                    warn!(
                        account = %address,
                        event_type = %e.event_type,
                        "Filtered unmappable account event"
                    );
                }
                mapped
            })
            .collect();

        Ok(EventsPage {
            events,
            next_cursor: raw.next.filter(|n| !n.is_empty()),
            raw_count,
        })
    }

    async fn account_nfts_page(
        &self,
        address: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<NftsPage, UpstreamError> {
        let mut request = self
            .get(
                &format!("/chain/ethereum/account/{address}/nfts"),
                self.nft_timeout,
            )
            .query(&[("limit", limit.to_string())]);
        if let Some(next) = cursor {
            request = request.query(&[("next", next)]);
        }

        let raw: RawNftsResponse = send_json(request).await?;
        let nfts = raw
            .nfts
            .into_iter()
            .filter_map(|n| {
                let identifier = n.identifier?;
                let collection = n.collection.filter(|c| !c.is_empty())?;
                let contract = n.contract.and_then(|c| normalize_address(&c))?;
                Some(WalletNft {
                    identifier,
                    collection,
                    contract,
                    name: n.name,
                    image_url: n.image_url,
                })
            })
            .collect();

        Ok(NftsPage {
            nfts,
            next_cursor: raw.next.filter(|n| !n.is_empty()),
        })
    }

    async fn account_profile(&self, account: &str) -> Result<Option<AccountProfile>, UpstreamError> {
        let result: Result<RawAccount, UpstreamError> =
            send_json(self.get(&format!("/accounts/{account}"), self.fetch_timeout)).await;

        match result {
            Ok(raw) => {
                let address = match raw.address.and_then(|a| normalize_address(&a)) {
                    Some(a) => a,
                    None => return Ok(None),
                };
                Ok(Some(AccountProfile {
                    address,
                    username: raw.username.filter(|u| !u.is_empty()),
                }))
            }
            Err(UpstreamError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// --- Raw wire shapes ---

#[derive(Debug, Default, Deserialize)]
struct RawCollection {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    safelist_status: Option<String>,
    #[serde(default)]
    total_supply: Option<i64>,
    #[serde(default)]
    stats: Option<RawCollectionStats>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCollectionStats {
    #[serde(default)]
    total_volume: Option<f64>,
    #[serde(default)]
    market_cap: Option<f64>,
    #[serde(default)]
    num_owners: Option<i64>,
    #[serde(default)]
    floor_price: Option<f64>,
}

impl RawCollection {
    fn flatten(self, slug: &str) -> CollectionData {
        let stats = self.stats.unwrap_or_default();
        CollectionData {
            slug: slug.to_string(),
            name: self.name.filter(|s| !s.is_empty()),
            description: self.description.filter(|s| !s.is_empty()),
            image_url: self.image_url.filter(|s| !s.is_empty()),
            safelist_status: self.safelist_status.filter(|s| !s.is_empty()),
            total_supply: self.total_supply.unwrap_or(0),
            num_owners: stats.num_owners.unwrap_or(0),
            total_volume: stats.total_volume.unwrap_or(0.0),
            market_cap: stats.market_cap.unwrap_or(0.0),
            floor_price_eth: stats.floor_price.unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawBestListings {
    #[serde(default)]
    listings: Vec<RawListing>,
}

#[derive(Debug, Default, Deserialize)]
struct RawListing {
    #[serde(default)]
    price: Option<RawListingPrice>,
}

#[derive(Debug, Default, Deserialize)]
struct RawListingPrice {
    #[serde(default)]
    current: Option<RawPriceAmount>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPriceAmount {
    #[serde(default)]
    value: String,
    #[serde(default = "default_decimals")]
    decimals: u32,
}

fn default_decimals() -> u32 {
    18
}

impl RawListing {
    fn price_eth(&self) -> Option<f64> {
        let amount = self.price.as_ref()?.current.as_ref()?;
        crate::upstream::scaled_amount(&amount.value, amount.decimals)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawEventsResponse {
    #[serde(default)]
    asset_events: Vec<RawAccountEvent>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAccountEvent {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub event_timestamp: Option<Value>,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub order_hash: Option<String>,
    #[serde(default)]
    pub nft: Option<RawEventNft>,
    #[serde(default)]
    pub payment: Option<RawEventPayment>,
    #[serde(default)]
    pub seller: Option<String>,
    #[serde(default)]
    pub buyer: Option<String>,
    #[serde(default)]
    pub taker: Option<String>,
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default)]
    pub to_address: Option<String>,
    #[serde(default)]
    pub quantity: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEventNft {
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub contract: Option<String>,
    #[serde(default)]
    pub display_image_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEventPayment {
    #[serde(default)]
    pub quantity: Option<Value>,
    #[serde(default)]
    pub token_address: Option<String>,
    #[serde(default)]
    pub decimals: Option<Value>,
    #[serde(default)]
    pub symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawNftsResponse {
    #[serde(default)]
    nfts: Vec<RawWalletNft>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWalletNft {
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    contract: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAccount {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

// --- Event normalization ---

/// Parse a raw event timestamp into Unix milliseconds. Accepts ISO-8601
/// strings (with or without zone) and epoch numbers in seconds or
/// milliseconds. Unparseable input maps to 0.
pub fn parse_event_timestamp(raw: Option<&Value>) -> i64 {
    match raw {
        Some(Value::String(s)) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return dt.timestamp_millis();
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return naive.and_utc().timestamp_millis();
            }
            0
        }
        Some(Value::Number(n)) => {
            let n = n.as_i64().unwrap_or(0);
            if n <= 0 {
                0
            } else if n < 1_000_000_000_000 {
                // Epoch seconds.
                n * 1000
            } else {
                n
            }
        }
        _ => 0,
    }
}

fn value_as_i64(raw: Option<&Value>) -> Option<i64> {
    match raw {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(raw: Option<&Value>) -> Option<String> {
    match raw {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn pick_address(candidates: &[&Option<String>]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|c| c.as_deref())
        .find_map(normalize_address)
}

/// Normalize one raw account event into an [`ActivityEvent`].
///
/// `None` means the record failed an invariant and is filtered out:
/// unknown event type, missing NFT identity, no resolvable address on
/// either side, a sale without complete payment data, or a negative
/// quantity.
pub fn map_raw_event(raw: &RawAccountEvent) -> Option<ActivityEvent> {
    let event_type = EventType::parse(&raw.event_type)?;

    let created_date = parse_event_timestamp(raw.event_timestamp.as_ref());

    let transaction = raw
        .transaction
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| raw.order_hash.clone().filter(|h| !h.is_empty()))
        .unwrap_or_default();

    let raw_nft = raw.nft.as_ref()?;
    let identifier = raw_nft.identifier.clone().filter(|i| !i.is_empty())?;
    let collection = raw_nft.collection.clone().filter(|c| !c.is_empty())?;
    let contract = raw_nft
        .contract
        .as_deref()
        .and_then(normalize_address)?;

    let (from, to) = match event_type {
        EventType::Sale => (
            pick_address(&[&raw.seller, &raw.from_address]),
            pick_address(&[&raw.taker, &raw.buyer, &raw.to_address]),
        ),
        EventType::Transfer | EventType::Cancel => (
            pick_address(&[&raw.from_address, &raw.seller]),
            pick_address(&[&raw.to_address, &raw.taker, &raw.buyer]),
        ),
    };
    if from.is_none() && to.is_none() {
        return None;
    }

    let payment = match event_type {
        EventType::Sale => {
            let p = raw.payment.as_ref()?;
            let quantity = value_as_string(p.quantity.as_ref())?;
            let token_address = p.token_address.clone().filter(|t| !t.is_empty())?;
            let decimals = value_as_string(p.decimals.as_ref())?;
            let symbol = p.symbol.clone().filter(|s| !s.is_empty())?;
            Some(EventPayment {
                quantity,
                token_address: token_address.to_ascii_lowercase(),
                decimals,
                symbol,
            })
        }
        // Cancels keep the transfer-style address mapping and no payment.
        EventType::Transfer | EventType::Cancel => None,
    };

    let quantity = value_as_i64(raw.quantity.as_ref()).unwrap_or_else(|| match &payment {
        Some(p) => p.quantity.parse().unwrap_or(1),
        None => 1,
    });
    if quantity < 0 {
        return None;
    }

    Some(ActivityEvent {
        event_type,
        created_date,
        transaction,
        nft: EventNft {
            identifier,
            collection,
            contract,
            display_image_url: raw_nft.display_image_url.clone().unwrap_or_default(),
            image_url: raw_nft.image_url.clone().unwrap_or_default(),
            name: raw_nft.name.clone().filter(|n| !n.is_empty()),
        },
        payment,
        from_account: EventAccount {
            address: from.unwrap_or_else(|| ZERO_ADDRESS.to_string()),
            user: None,
        },
        to_account: EventAccount {
            address: to.unwrap_or_else(|| ZERO_ADDRESS.to_string()),
            user: None,
        },
        quantity,
    })
}
