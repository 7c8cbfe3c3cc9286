//! HTTP request handlers.

use crate::admin;
use crate::error::Error;
use crate::metrics::METRICS;
use crate::models::{cache_keys, normalize_address, PortfolioJob, PortfolioSummary};
use crate::queue::{portfolio_job_options, COLLECTION_QUEUE, PORTFOLIO_QUEUE};
use crate::response::{
    ActivityResponse, BatchCollectionsResponse, ClearCacheResponse, EnsResponse, HealthResponse,
    MarketQuotesResponse, Pagination, PortfolioResponse, QueueStats, SyncStatusResponse,
};
use crate::state::AppState;
use crate::workers::SyncOutcome;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Deserialize)]
pub struct BatchCollectionsRequest {
    #[serde(default)]
    pub slugs: Vec<String>,
}

/// `POST /api/collections/batch`: cache-only batch read.
pub async fn batch_collections(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchCollectionsRequest>,
) -> Result<Json<BatchCollectionsResponse>, Error> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    METRICS.requests_total.fetch_add(1, Ordering::Relaxed);

    let results = state.collections.get_batch_from_cache(&request.slugs).await?;

    let mut data = Map::new();
    for (slug, item) in results {
        match item {
            Some(cached) => {
                METRICS.cache_hits.fetch_add(1, Ordering::Relaxed);
                data.insert(
                    slug,
                    serde_json::to_value(cached).unwrap_or(Value::Object(Map::new())),
                );
            }
            None => {
                METRICS.cache_misses.fetch_add(1, Ordering::Relaxed);
                data.insert(slug, Value::Object(Map::new()));
            }
        }
    }
    Ok(Json(BatchCollectionsResponse { data }))
}

/// `GET /api/portfolio/:address/summary`: cached summary or a 202 while
/// the calculation job runs.
pub async fn portfolio_summary(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, Error> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    METRICS.requests_total.fetch_add(1, Ordering::Relaxed);

    let address = normalize_address(&address)
        .ok_or_else(|| Error::InvalidInput(format!("bad address: {address}")))?;

    let key = cache_keys::portfolio_summary(&address);
    if let Ok(Some(payload)) = state.cache.get(&key).await {
        if let Ok(summary) = serde_json::from_str::<PortfolioSummary>(&payload) {
            METRICS.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((StatusCode::OK, Json(PortfolioResponse::ready(summary))));
        }
        warn!(key = %key, "Unparsable portfolio payload treated as miss");
    }
    METRICS.cache_misses.fetch_add(1, Ordering::Relaxed);

    let job = PortfolioJob {
        address: address.clone(),
    };
    match state
        .queue
        .add(
            PORTFOLIO_QUEUE,
            &address,
            serde_json::to_value(&job).unwrap_or(Value::Null),
            &portfolio_job_options(),
        )
        .await
    {
        Ok(_) => Ok((StatusCode::ACCEPTED, Json(PortfolioResponse::calculating()))),
        Err(e) => {
            error!(account = %address, error = %e, "Portfolio enqueue failed");
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PortfolioResponse::error("Could not schedule calculation")),
            ))
        }
    }
}

#[derive(Deserialize)]
pub struct ActivityQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    20
}

/// `GET /api/account/:address/activity`: current store snapshot plus a
/// fire-and-forget background sync.
pub async fn account_activity(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<ActivityResponse>, Error> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    METRICS.requests_total.fetch_add(1, Ordering::Relaxed);

    let address = normalize_address(&address)
        .ok_or_else(|| Error::InvalidInput(format!("bad address: {address}")))?;
    if query.page < 1 {
        return Err(Error::InvalidInput("page must be >= 1".into()));
    }
    if !(1..=100).contains(&query.limit) {
        return Err(Error::InvalidInput("limit must be within 1..=100".into()));
    }

    let total = state
        .events
        .count_events_for_account(&address)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;
    let skip = (query.page - 1) * query.limit;
    let events = state
        .events
        .events_for_account_paginated(&address, skip, query.limit)
        .await
        .map_err(|e| Error::Store(e.to_string()))?;

    // Refresh behind the response; the snapshot above is what we serve.
    let sync = Arc::clone(&state.sync);
    let sync_address = address.clone();
    tokio::spawn(async move {
        METRICS.syncs_started.fetch_add(1, Ordering::Relaxed);
        match sync.sync_account(&sync_address).await {
            Ok(SyncOutcome::AlreadySyncing) => {}
            Ok(SyncOutcome::Completed(report)) => {
                METRICS
                    .events_upserted
                    .fetch_add(report.upserted, Ordering::Relaxed);
                info!(account = %sync_address, upserted = report.upserted, "Background sync done");
            }
            Err(e) => warn!(account = %sync_address, error = %e, "Background sync failed"),
        }
    });

    let total_pages = if total == 0 {
        0
    } else {
        (total + query.limit - 1) / query.limit
    };
    Ok(Json(ActivityResponse {
        address,
        pagination: Pagination {
            current_page: query.page,
            limit: query.limit,
            total_pages,
            total_items: total,
        },
        events,
    }))
}

/// `GET /api/account/:address/sync-status`.
pub async fn sync_status(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<SyncStatusResponse>, Error> {
    let address = normalize_address(&address)
        .ok_or_else(|| Error::InvalidInput(format!("bad address: {address}")))?;
    let status = if state.sync.is_syncing(&address) {
        "syncing"
    } else {
        "idle"
    };
    Ok(Json(SyncStatusResponse { address, status }))
}

/// `GET /api/ens/resolve/:name`.
pub async fn ens_resolve(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<EnsResponse>, Error> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    match state.lookups.resolve_ens(&name).await? {
        Some(address) => Ok(Json(EnsResponse {
            ens_name: name.trim().to_ascii_lowercase(),
            address,
        })),
        None => Err(Error::NotFound(format!("no address for {name}"))),
    }
}

/// `GET /api/ens/lookup/:address`.
pub async fn ens_lookup(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<EnsResponse>, Error> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let normalized = normalize_address(&address)
        .ok_or_else(|| Error::InvalidInput(format!("bad address: {address}")))?;
    match state.lookups.lookup_ens(&normalized).await? {
        Some(name) => Ok(Json(EnsResponse {
            ens_name: name,
            address: normalized,
        })),
        None => Err(Error::NotFound(format!("no name for {normalized}"))),
    }
}

/// `GET /api/user/:address`: cached marketplace profile.
pub async fn user_profile(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<crate::upstream::AccountProfile>, Error> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    match state.lookups.user_profile(&address).await? {
        Some(profile) => Ok(Json(profile)),
        None => Err(Error::NotFound(format!("no profile for {address}"))),
    }
}

/// `GET /api/market/quotes`: current poller snapshot.
pub async fn market_quotes(State(state): State<Arc<AppState>>) -> Json<MarketQuotesResponse> {
    let snapshot = state.quotes.snapshot();
    Json(MarketQuotesResponse {
        eth_fiat: snapshot.eth_fiat,
        gas_gwei: snapshot.gas_gwei,
        prices_updated_at: snapshot.prices_updated_at.map(|t| t.to_rfc3339()),
        gas_updated_at: snapshot.gas_updated_at.map(|t| t.to_rfc3339()),
    })
}

/// `POST /admin/cache/clear`: scan-and-delete all known namespaces.
pub async fn clear_cache(State(state): State<Arc<AppState>>) -> Json<ClearCacheResponse> {
    let report = admin::clear_all_known_caches(&state.cache).await;
    Json(ClearCacheResponse {
        success: true,
        patterns: report.patterns,
        total: report.total,
    })
}

/// Health check with basic metrics.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let quotes = state.quotes.snapshot();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        requests: state.request_count.load(Ordering::Relaxed),
        queues: QueueStats {
            collection: state.queue.depth(COLLECTION_QUEUE).await.unwrap_or_default(),
            portfolio: state.queue.depth(PORTFOLIO_QUEUE).await.unwrap_or_default(),
        },
        eth_price_usd: quotes.eth_usd(),
        gas_gwei: quotes.gas_gwei,
    })
}

/// Prometheus text metrics.
pub async fn metrics() -> impl IntoResponse {
    METRICS.render()
}
