//! Domain records shared across the cache, store, workers and HTTP edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The Ethereum zero address, used to fill missing event address slots.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Lower-case and validate a `0x`-prefixed 40-hex-char address.
/// Returns `None` for anything that is not a well-formed address.
pub fn normalize_address(input: &str) -> Option<String> {
    let addr = input.trim().to_ascii_lowercase();
    let hex = addr.strip_prefix("0x")?;
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(addr)
}

pub fn is_valid_address(input: &str) -> bool {
    normalize_address(input).is_some()
}

// --- Collections ---

/// Combined collection metadata + floor price, the aggregator's output and
/// the record store row shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionData {
    pub slug: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub safelist_status: Option<String>,
    pub total_supply: i64,
    pub num_owners: i64,
    pub total_volume: f64,
    pub market_cap: f64,
    pub floor_price_eth: f64,
}

impl CollectionData {
    /// Default-zero record carrying only the slug. Returned when the
    /// upstream knows nothing about the collection.
    pub fn default_for_slug(slug: &str) -> Self {
        Self {
            slug: slug.to_string(),
            name: None,
            description: None,
            image_url: None,
            safelist_status: None,
            total_supply: 0,
            num_owners: 0,
            total_volume: 0.0,
            market_cap: 0.0,
            floor_price_eth: 0.0,
        }
    }
}

/// Stored collection metadata row (record store).
#[derive(Debug, Clone)]
pub struct CollectionMetadata {
    pub data: CollectionData,
    pub data_last_fetched_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cache payload for `collection:<slug>` keys, flat shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedCollection {
    pub slug: String,
    pub floor_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safelist_status: Option<String>,
    pub total_supply: i64,
    pub num_owners: i64,
    pub total_volume: f64,
    pub market_cap: f64,
    #[serde(rename = "lastUpdated")]
    pub last_updated: String,
    pub source: String,
}

impl CachedCollection {
    pub fn from_data(data: &CollectionData, source: &str, now: DateTime<Utc>) -> Self {
        Self {
            slug: data.slug.clone(),
            floor_price: data.floor_price_eth,
            name: data.name.clone(),
            image_url: data.image_url.clone(),
            safelist_status: data.safelist_status.clone(),
            total_supply: data.total_supply,
            num_owners: data.num_owners,
            total_volume: data.total_volume,
            market_cap: data.market_cap,
            last_updated: now.to_rfc3339(),
            source: source.to_string(),
        }
    }
}

/// Parse a `collection:*` cache payload. Two historical shapes exist: the
/// flat [`CachedCollection`] and a legacy `{info, price}` wrapper; both are
/// accepted and normalized. Anything else is treated as a cache miss.
pub fn parse_cached_collection(raw: &str) -> Option<CachedCollection> {
    if let Ok(flat) = serde_json::from_str::<CachedCollection>(raw) {
        if !flat.slug.is_empty() {
            return Some(flat);
        }
    }

    // Legacy shape: {"info": {...}, "price": {"floor_price": ...}}
    let value: Value = serde_json::from_str(raw).ok()?;
    let info = value.get("info")?;
    let price = value.get("price");
    let slug = info.get("slug")?.as_str()?.to_string();
    if slug.is_empty() {
        return None;
    }
    let floor = price
        .and_then(|p| p.get("floor_price").or_else(|| p.get("floorPriceEth")))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    Some(CachedCollection {
        slug,
        floor_price: floor,
        name: info.get("name").and_then(Value::as_str).map(String::from),
        image_url: info
            .get("image_url")
            .and_then(Value::as_str)
            .map(String::from),
        safelist_status: info
            .get("safelist_status")
            .and_then(Value::as_str)
            .map(String::from),
        total_supply: info
            .get("total_supply")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        num_owners: info.get("num_owners").and_then(Value::as_i64).unwrap_or(0),
        total_volume: info
            .get("total_volume")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        market_cap: info.get("market_cap").and_then(Value::as_f64).unwrap_or(0.0),
        last_updated: value
            .get("lastUpdated")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        source: value
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("legacy-cache")
            .to_string(),
    })
}

// --- Activity events ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Sale,
    Transfer,
    Cancel,
}

impl EventType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sale" => Some(EventType::Sale),
            "transfer" => Some(EventType::Transfer),
            "cancel" => Some(EventType::Cancel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Sale => "sale",
            EventType::Transfer => "transfer",
            EventType::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventNft {
    pub identifier: String,
    pub collection: String,
    pub contract: String,
    pub display_image_url: String,
    pub image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventPayment {
    pub quantity: String,
    pub token_address: String,
    pub decimals: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventAccount {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// One normalized entry of an account's activity timeline.
/// Uniqueness key: (`transaction`, `event_type`, `nft.identifier`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub event_type: EventType,
    /// Unix milliseconds.
    pub created_date: i64,
    pub transaction: String,
    pub nft: EventNft,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<EventPayment>,
    pub from_account: EventAccount,
    pub to_account: EventAccount,
    pub quantity: i64,
}

impl ActivityEvent {
    pub fn unique_key(&self) -> (String, &'static str, String) {
        (
            self.transaction.clone(),
            self.event_type.as_str(),
            self.nft.identifier.clone(),
        )
    }
}

// --- Wallet NFTs ---

/// One NFT from the wallet listing upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletNft {
    pub identifier: String,
    pub collection: String,
    pub contract: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

// --- Portfolio ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionHolding {
    pub slug: String,
    pub contract_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safelist_status: Option<String>,
    pub nft_count: u64,
    pub floor_price_eth: f64,
    pub total_value_eth: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub floor_price_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_value_usd: Option<f64>,
}

/// Derived portfolio valuation, cache-only (`portfolio:summary:<addr>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSummary {
    pub total_value_eth: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_value_usd: Option<f64>,
    pub nft_count: u64,
    pub collection_count: u64,
    pub breakdown: Vec<CollectionHolding>,
    /// ISO-8601.
    pub calculated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eth_price_usd: Option<f64>,
}

impl PortfolioSummary {
    /// Zero-valued summary for an empty wallet.
    pub fn empty(eth_price_usd: Option<f64>, now: DateTime<Utc>) -> Self {
        Self {
            total_value_eth: 0.0,
            total_value_usd: Some(0.0),
            nft_count: 0,
            collection_count: 0,
            breakdown: Vec::new(),
            calculated_at: now.to_rfc3339(),
            eth_price_usd: Some(eth_price_usd.unwrap_or(0.0)),
        }
    }
}

// --- Queue job payloads ---

/// Data of a collection-fetch job; the job id is the slug.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionJob {
    pub slug: String,
    #[serde(default)]
    pub contract_address: String,
}

/// Data of a portfolio-calculation job; the job id is the address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortfolioJob {
    pub address: String,
}

// --- Cache key namespaces ---

pub mod cache_keys {
    pub fn collection(slug: &str) -> String {
        format!("collection:{slug}")
    }

    pub fn portfolio_summary(address: &str) -> String {
        format!("portfolio:summary:{address}")
    }

    pub fn ens_resolve(name: &str) -> String {
        format!("ens:resolve:{name}")
    }

    pub fn ens_lookup(address: &str) -> String {
        format!("ens:lookup:{address}")
    }

    pub fn nftgo_floor(contract: &str) -> String {
        format!("nftgo:floor-price:{contract}")
    }

    pub fn opensea_user(address: &str) -> String {
        format!("user:opensea:{address}")
    }
}
