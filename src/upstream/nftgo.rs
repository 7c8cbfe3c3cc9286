//! NFT-data provider client: floor prices by contract across marketplaces.

use crate::upstream::{send_json, UpstreamError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Floor price entry for one marketplace.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketplaceFloor {
    pub marketplace: String,
    pub floor_price_eth: f64,
}

/// Floor-price surface of the NFT-data provider.
#[async_trait]
pub trait FloorPriceApi: Send + Sync {
    /// Floor prices per marketplace for a contract. An unknown contract
    /// (upstream 404) yields an empty list, not an error.
    async fn floor_prices(&self, contract: &str) -> Result<Vec<MarketplaceFloor>, UpstreamError>;
}

pub struct NftGoClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl NftGoClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout,
        }
    }
}

#[async_trait]
impl FloorPriceApi for NftGoClient {
    async fn floor_prices(&self, contract: &str) -> Result<Vec<MarketplaceFloor>, UpstreamError> {
        let request = self
            .http
            .get(format!(
                "{}/marketplace/{contract}/floor-price",
                self.base_url
            ))
            .header("X-API-KEY", &self.api_key)
            .header("accept", "application/json")
            .timeout(self.timeout);

        let result: Result<RawFloorResponse, UpstreamError> = send_json(request).await;
        match result {
            Ok(body) => Ok(body
                .marketplace_floor_price_list
                .into_iter()
                .filter_map(|e| {
                    let marketplace = e.marketplace_name?;
                    let floor = e.floor_price?.value?;
                    Some(MarketplaceFloor {
                        marketplace: marketplace.to_ascii_lowercase(),
                        floor_price_eth: floor,
                    })
                })
                .collect()),
            Err(UpstreamError::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawFloorResponse {
    #[serde(default)]
    marketplace_floor_price_list: Vec<RawMarketplaceFloor>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMarketplaceFloor {
    #[serde(default)]
    marketplace_name: Option<String>,
    #[serde(default)]
    floor_price: Option<RawFloorValue>,
}

#[derive(Debug, Default, Deserialize)]
struct RawFloorValue {
    #[serde(default)]
    value: Option<f64>,
}
