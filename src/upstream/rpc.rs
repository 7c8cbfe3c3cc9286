//! RPC provider client: gas price via JSON-RPC.

use crate::upstream::{from_reqwest, UpstreamError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Gas-price surface of the RPC provider.
#[async_trait]
pub trait GasApi: Send + Sync {
    /// Current gas price in wei.
    async fn gas_price_wei(&self) -> Result<u128, UpstreamError>;
}

pub struct EthRpcClient {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl EthRpcClient {
    pub fn new(http: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl GasApi for EthRpcClient {
    async fn gas_price_wei(&self) -> Result<u128, UpstreamError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_gasPrice",
            "params": []
        });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(crate::upstream::classify_status(status.as_u16(), None, text));
        }

        let rpc: RpcResponse = response.json().await.map_err(from_reqwest)?;
        if let Some(error) = rpc.error {
            return Err(UpstreamError::Transient(format!("rpc error: {error}")));
        }
        let hex = rpc
            .result
            .ok_or_else(|| UpstreamError::Transient("rpc response missing result".into()))?;
        parse_hex_quantity(&hex)
            .ok_or_else(|| UpstreamError::Transient(format!("bad gas price quantity: {hex}")))
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

fn parse_hex_quantity(hex: &str) -> Option<u128> {
    u128::from_str_radix(hex.strip_prefix("0x")?, 16).ok()
}

/// Wei → gwei, for display and the quote snapshot.
pub fn wei_to_gwei(wei: u128) -> f64 {
    wei as f64 / 1e9
}
