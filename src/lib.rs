//! # NFT Gateway
//!
//! Read-through aggregation layer in front of NFT market data providers:
//! per-collection metadata and floor prices, per-account activity feeds,
//! portfolio valuations and market quotes, served from a hot cache while
//! background workers refresh it.
//!
//! ## Quick start
//! ```bash
//! cargo run --bin gateway
//! ```
//!
//! ## Endpoints
//! - `POST /api/collections/batch`: cached collection data, misses queued
//! - `GET /api/portfolio/:address/summary`: 200 ready / 202 calculating
//! - `GET /api/account/:address/activity`: stored events + background sync
//! - `GET /api/account/:address/sync-status`
//! - `GET /api/ens/resolve/:name`, `GET /api/ens/lookup/:address`
//! - `GET /api/market/quotes`, `GET /health`, `GET /metrics`
//! - `POST /admin/cache/clear`

pub mod admin;
pub mod aggregator;
pub mod cache;
pub mod collections;
pub mod config;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod lookups;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod prices;
pub mod queue;
pub mod response;
pub mod retry;
pub mod router;
pub mod state;
pub mod store;
pub mod upstream;
pub mod workers;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use error::Error;
pub use router::create as create_router;
pub use state::AppState;
