//! Market quote singletons: ETH fiat prices and gas, refreshed by
//! periodic background tasks. Readers get a cloned snapshot; a failed
//! refresh keeps the previous values.

use crate::upstream::rpc::wei_to_gwei;
use crate::upstream::{GasApi, PriceApi};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Fiat currencies kept in the snapshot.
const QUOTE_CURRENCIES: [&str; 3] = ["usd", "eur", "gbp"];

#[derive(Debug, Clone, Default)]
pub struct MarketQuotes {
    pub eth_fiat: HashMap<String, f64>,
    pub gas_gwei: Option<f64>,
    pub prices_updated_at: Option<DateTime<Utc>>,
    pub gas_updated_at: Option<DateTime<Utc>>,
}

impl MarketQuotes {
    pub fn eth_usd(&self) -> Option<f64> {
        self.eth_fiat.get("usd").copied()
    }
}

/// Shared snapshot holder. Cheap to clone; all clones see the same state.
#[derive(Clone, Default)]
pub struct QuoteCache {
    inner: Arc<RwLock<MarketQuotes>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MarketQuotes {
        self.inner.read().expect("quote lock poisoned").clone()
    }

    pub fn eth_usd(&self) -> Option<f64> {
        self.snapshot().eth_usd()
    }

    fn set_prices(&self, prices: HashMap<String, f64>) {
        let mut quotes = self.inner.write().expect("quote lock poisoned");
        quotes.eth_fiat = prices;
        quotes.prices_updated_at = Some(Utc::now());
    }

    fn set_gas(&self, gwei: f64) {
        let mut quotes = self.inner.write().expect("quote lock poisoned");
        quotes.gas_gwei = Some(gwei);
        quotes.gas_updated_at = Some(Utc::now());
    }
}

/// One fiat-price refresh. Failures keep the last snapshot.
pub async fn refresh_prices(quotes: &QuoteCache, api: &Arc<dyn PriceApi>) {
    match api.eth_price(&QUOTE_CURRENCIES).await {
        Ok(prices) if !prices.is_empty() => {
            debug!(usd = ?prices.get("usd"), "ETH price refreshed");
            quotes.set_prices(prices);
        }
        Ok(_) => warn!("Price provider returned no quotes"),
        Err(e) => warn!(error = %e, "ETH price refresh failed"),
    }
}

/// One gas refresh. Failures keep the last snapshot.
pub async fn refresh_gas(quotes: &QuoteCache, api: &Arc<dyn GasApi>) {
    match api.gas_price_wei().await {
        Ok(wei) => {
            let gwei = wei_to_gwei(wei);
            debug!(gwei, "Gas price refreshed");
            quotes.set_gas(gwei);
        }
        Err(e) => warn!(error = %e, "Gas price refresh failed"),
    }
}

/// Fiat-price poller loop; call from a `tokio::spawn`.
pub async fn run_price_poller(quotes: QuoteCache, api: Arc<dyn PriceApi>, interval: Duration) {
    loop {
        refresh_prices(&quotes, &api).await;
        tokio::time::sleep(interval).await;
    }
}

/// Gas poller loop; call from a `tokio::spawn`.
pub async fn run_gas_poller(quotes: QuoteCache, api: Arc<dyn GasApi>, interval: Duration) {
    loop {
        refresh_gas(&quotes, &api).await;
        tokio::time::sleep(interval).await;
    }
}
