//! HTTP router and middleware stack.

use crate::handlers;
use crate::middleware::{admin_auth, inject_request_id};
use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_SIZE: usize = 256 * 1024; // 256 KB
const MAX_CONCURRENT_BATCH: usize = 256;
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub fn create(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    let admin_routes = Router::new()
        .route("/admin/cache/clear", post(handlers::clear_cache))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            admin_auth,
        ));

    let batch_route = Router::new()
        .route("/api/collections/batch", post(handlers::batch_collections))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_BATCH));

    let api_routes = Router::new()
        .route(
            "/api/portfolio/:address/summary",
            get(handlers::portfolio_summary),
        )
        .route(
            "/api/account/:address/activity",
            get(handlers::account_activity),
        )
        .route(
            "/api/account/:address/sync-status",
            get(handlers::sync_status),
        )
        .route("/api/ens/resolve/:name", get(handlers::ens_resolve))
        .route("/api/ens/lookup/:address", get(handlers::ens_lookup))
        .route("/api/user/:address", get(handlers::user_profile))
        .route("/api/market/quotes", get(handlers::market_quotes));

    let public_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics));

    public_routes
        .merge(batch_route)
        .merge(api_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn(inject_request_id))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{cache_keys, CachedCollection, PortfolioSummary};
    use crate::queue::{JobState, COLLECTION_QUEUE, PORTFOLIO_QUEUE};
    use crate::store::EventStore;
    use crate::testutil::{collection, test_state, TestState};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    const ADDR: &str = "0x00000000000000000000000000000000000000aa";

    async fn send(
        test: &TestState,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let app = create(Arc::clone(&test.state));
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn cold_batch_returns_placeholders_and_enqueues() {
        let test = test_state();
        let (status, body) = send(
            &test,
            "POST",
            "/api/collections/batch",
            Some(json!({"slugs": ["azuki", "doodles-official"]})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["azuki"], json!({}));
        assert_eq!(body["data"]["doodles-official"], json!({}));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut waiting = test.queue.waiting_ids(COLLECTION_QUEUE);
        waiting.sort();
        assert_eq!(waiting, vec!["azuki", "doodles-official"]);
    }

    #[tokio::test]
    async fn warm_batch_serves_cached_floor() {
        let test = test_state();
        let data = crate::models::CollectionData {
            floor_price_eth: 5.0,
            ..collection("azuki", "Azuki", 10_000)
        };
        let payload = CachedCollection::from_data(&data, "worker-cache", Utc::now());
        test.cache.insert(
            "collection:azuki",
            &serde_json::to_string(&payload).unwrap(),
            Duration::from_secs(600),
        );

        let (status, body) = send(
            &test,
            "POST",
            "/api/collections/batch",
            Some(json!({"slugs": ["azuki"]})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["azuki"]["floor_price"], json!(5.0));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(test.queue.waiting_ids(COLLECTION_QUEUE).is_empty());
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let test = test_state();
        let slugs: Vec<String> = (0..101).map(|i| format!("slug-{i}")).collect();
        let (status, _) = send(
            &test,
            "POST",
            "/api/collections/batch",
            Some(json!({ "slugs": slugs })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn portfolio_miss_returns_202_and_enqueues() {
        let test = test_state();
        let (status, body) = send(
            &test,
            "GET",
            &format!("/api/portfolio/{ADDR}/summary"),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "calculating");
        assert_eq!(body["data"], Value::Null);
        assert_eq!(
            test.queue.job_state(PORTFOLIO_QUEUE, ADDR),
            Some(JobState::Waiting)
        );
    }

    #[tokio::test]
    async fn portfolio_hit_returns_ready_summary() {
        let test = test_state();
        let summary = PortfolioSummary::empty(Some(3000.0), Utc::now());
        test.cache.insert(
            &cache_keys::portfolio_summary(ADDR),
            &serde_json::to_string(&summary).unwrap(),
            Duration::from_secs(600),
        );

        let (status, body) = send(
            &test,
            "GET",
            &format!("/api/portfolio/{ADDR}/summary"),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["data"]["ethPriceUsd"], json!(3000.0));
        assert!(test.queue.waiting_ids(PORTFOLIO_QUEUE).is_empty());
    }

    #[tokio::test]
    async fn malformed_address_is_a_400() {
        let test = test_state();
        let (status, _) = send(&test, "GET", "/api/portfolio/nonsense/summary", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&test, "GET", "/api/account/0x123/activity", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn activity_returns_snapshot_with_pagination() {
        let test = test_state();
        for i in 0..25 {
            test.events
                .bulk_upsert_events(&[crate::testutil::sale_event(
                    &format!("0xtx{i}"),
                    &i.to_string(),
                    1_700_000_000_000 + i as i64 * 1000,
                    ADDR,
                )])
                .await
                .unwrap();
        }

        let (status, body) = send(
            &test,
            "GET",
            &format!("/api/account/{ADDR}/activity?page=2&limit=10"),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pagination"]["currentPage"], 2);
        assert_eq!(body["pagination"]["totalItems"], 25);
        assert_eq!(body["pagination"]["totalPages"], 3);
        assert_eq!(body["events"].as_array().unwrap().len(), 10);
        // Descending order: page 2 starts below the newest ten.
        assert_eq!(body["events"][0]["createdDate"], json!(1_700_000_014_000i64));
    }

    #[tokio::test]
    async fn activity_rejects_bad_paging() {
        let test = test_state();
        let (status, _) = send(
            &test,
            "GET",
            &format!("/api/account/{ADDR}/activity?page=0"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &test,
            "GET",
            &format!("/api/account/{ADDR}/activity?limit=101"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sync_status_reports_idle() {
        let test = test_state();
        let (status, body) = send(
            &test,
            "GET",
            &format!("/api/account/{ADDR}/sync-status"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "idle");
    }

    #[tokio::test]
    async fn unknown_ens_name_is_a_404() {
        let test = test_state();
        let (status, _) = send(&test, "GET", "/api/ens/resolve/ghost.eth", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cache_clear_reports_counts() {
        let test = test_state();
        test.cache
            .insert("collection:azuki", "{}", Duration::from_secs(600));
        test.cache
            .insert("portfolio:summary:0xabc", "{}", Duration::from_secs(600));

        let (status, body) = send(&test, "POST", "/admin/cache/clear", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["total"], 2);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let test = test_state();
        let (status, body) = send(&test, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
