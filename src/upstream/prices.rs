//! Price-quote provider client: ETH fiat prices.

use crate::upstream::{send_json, UpstreamError};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Fiat-quote surface of the price provider.
#[async_trait]
pub trait PriceApi: Send + Sync {
    /// ETH price per requested fiat currency (lower-case codes).
    async fn eth_price(&self, currencies: &[&str]) -> Result<HashMap<String, f64>, UpstreamError>;
}

pub struct PriceQuoteClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl PriceQuoteClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PriceApi for PriceQuoteClient {
    async fn eth_price(&self, currencies: &[&str]) -> Result<HashMap<String, f64>, UpstreamError> {
        let vs = currencies.join(",");
        let request = self
            .http
            .get(format!("{}/simple/price", self.base_url))
            .query(&[("ids", "ethereum"), ("vs_currencies", vs.as_str())])
            .timeout(self.timeout);

        let raw: RawPriceResponse = send_json(request).await?;
        Ok(raw.ethereum)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawPriceResponse {
    #[serde(default)]
    ethereum: HashMap<String, f64>,
}
