//! API response types.

use crate::admin::PatternCount;
use crate::models::{ActivityEvent, PortfolioSummary};
use crate::queue::QueueDepth;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Serialize)]
pub struct BatchCollectionsResponse {
    /// slug → cached item, or `{}` while a refresh is queued.
    pub data: Map<String, Value>,
}

#[derive(Serialize)]
pub struct PortfolioResponse {
    pub status: &'static str,
    pub data: Option<PortfolioSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PortfolioResponse {
    pub fn ready(summary: PortfolioSummary) -> Self {
        Self {
            status: "ready",
            data: Some(summary),
            message: None,
        }
    }

    pub fn calculating() -> Self {
        Self {
            status: "calculating",
            data: None,
            message: Some("Portfolio calculation in progress, poll again shortly".into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            data: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub current_page: i64,
    pub limit: i64,
    pub total_pages: i64,
    pub total_items: i64,
}

#[derive(Serialize)]
pub struct ActivityResponse {
    pub address: String,
    pub pagination: Pagination,
    pub events: Vec<ActivityEvent>,
}

#[derive(Serialize)]
pub struct SyncStatusResponse {
    pub address: String,
    pub status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsResponse {
    pub ens_name: String,
    pub address: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketQuotesResponse {
    pub eth_fiat: std::collections::HashMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_gwei: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prices_updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_updated_at: Option<String>,
}

#[derive(Serialize)]
pub struct ClearCacheResponse {
    pub success: bool,
    pub patterns: Vec<PatternCount>,
    pub total: u64,
}

#[derive(Serialize)]
pub struct QueueStats {
    pub collection: QueueDepth,
    pub portfolio: QueueDepth,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub requests: u64,
    pub queues: QueueStats,
    pub eth_price_usd: Option<f64>,
    pub gas_gwei: Option<f64>,
}
