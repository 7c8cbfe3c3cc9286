//! Upstream provider clients.
//!
//! One client per provider, each with a narrow typed surface, a hard
//! per-call timeout, and normalization into internal record shapes. Raw
//! failures are classified into [`UpstreamError`] kinds that the retry
//! executor understands.

use serde::de::DeserializeOwned;
use std::fmt;

pub mod nftgo;
pub mod opensea;
pub mod prices;
pub mod rpc;

pub use nftgo::{FloorPriceApi, MarketplaceFloor, NftGoClient};
pub use opensea::{AccountProfile, EventsPage, MarketplaceApi, NftsPage, OpenSeaClient};
pub use prices::{PriceApi, PriceQuoteClient};
pub use rpc::{EthRpcClient, GasApi};

/// Classified upstream failure.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamError {
    /// 429. `retry_after` is the provider's hint in seconds, when present.
    RateLimited { retry_after: Option<u64> },
    /// 5xx, connection reset, timeout.
    Transient(String),
    /// 4xx other than 429/404. Not retried.
    Client { status: u16, message: String },
    /// 404. Mapped per endpoint to a domain default, never retried.
    NotFound,
}

impl UpstreamError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamError::RateLimited { .. } | UpstreamError::Transient(_)
        )
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::RateLimited { retry_after } => match retry_after {
                Some(secs) => write!(f, "rate limited (retry after {secs}s)"),
                None => write!(f, "rate limited"),
            },
            UpstreamError::Transient(msg) => write!(f, "transient upstream failure: {msg}"),
            UpstreamError::Client { status, message } => {
                write!(f, "upstream client error {status}: {message}")
            }
            UpstreamError::NotFound => write!(f, "upstream not found"),
        }
    }
}

impl std::error::Error for UpstreamError {}

pub(crate) fn from_reqwest(e: reqwest::Error) -> UpstreamError {
    // Timeouts, connection resets and decode failures are all worth a retry.
    UpstreamError::Transient(e.to_string())
}

/// Send a request and decode the JSON body, classifying failure statuses.
pub(crate) async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, UpstreamError> {
    let response = request.send().await.map_err(from_reqwest)?;
    let status = response.status();

    if status.is_success() {
        return response.json::<T>().await.map_err(from_reqwest);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    Err(classify_status(status.as_u16(), retry_after, body))
}

pub(crate) fn classify_status(status: u16, retry_after: Option<u64>, body: String) -> UpstreamError {
    match status {
        429 => UpstreamError::RateLimited { retry_after },
        404 => UpstreamError::NotFound,
        s if s >= 500 => UpstreamError::Transient(format!("status {s}: {body}")),
        s => UpstreamError::Client {
            status: s,
            message: body,
        },
    }
}

/// Convert a decimal token amount string into an ETH-scale float.
pub(crate) fn scaled_amount(value: &str, decimals: u32) -> Option<f64> {
    let raw: u128 = value.trim().parse().ok()?;
    Some(raw as f64 / 10f64.powi(decimals as i32))
}
