//! Record store: durable, indexed activity events and collection
//! metadata, backed by PostgreSQL.

use crate::models::{ActivityEvent, CollectionData, CollectionMetadata};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::fmt;
use std::time::Duration;

pub mod collections;
pub mod events;

/// Store failure. Read paths surface it; write paths log and continue.
#[derive(Debug)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError(e.to_string())
    }
}

/// Outcome of a bulk upsert. Duplicates are counted, never failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: u64,
    pub duplicates: u64,
}

/// Activity-event collection.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Newest event touching the account (either side), by `created_date`.
    async fn latest_event_for_account(
        &self,
        address: &str,
    ) -> Result<Option<ActivityEvent>, StoreError>;

    async fn count_events_for_account(&self, address: &str) -> Result<i64, StoreError>;

    /// Page of events touching the account, `created_date` descending.
    async fn events_for_account_paginated(
        &self,
        address: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ActivityEvent>, StoreError>;

    /// Unordered bulk upsert keyed on
    /// (`transaction`, `event_type`, `nft.identifier`).
    async fn bulk_upsert_events(&self, events: &[ActivityEvent]) -> Result<UpsertStats, StoreError>;
}

/// Collection-metadata collection with a 24 h freshness window.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Metadata for a slug, or `None` when absent or older than the TTL.
    async fn find_collection_metadata(
        &self,
        slug: &str,
    ) -> Result<Option<CollectionMetadata>, StoreError>;

    async fn upsert_collection_metadata(&self, data: &CollectionData) -> Result<(), StoreError>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError(e.to_string()))
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
