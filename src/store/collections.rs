//! Collection-metadata persistence with a 24 h freshness window.

use crate::models::{CollectionData, CollectionMetadata};
use crate::store::{CollectionStore, PgStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::FromRow;

/// Freshness window on `updated_at`; reads never return older rows.
const METADATA_TTL_SECONDS: i64 = 86_400;

#[derive(Debug, FromRow)]
struct DbCollectionRow {
    slug: String,
    name: Option<String>,
    description: Option<String>,
    image_url: Option<String>,
    safelist_status: Option<String>,
    total_supply: i64,
    num_owners: i64,
    total_volume: f64,
    market_cap: f64,
    floor_price_eth: f64,
    data_last_fetched_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DbCollectionRow {
    fn into_metadata(self) -> CollectionMetadata {
        CollectionMetadata {
            data: CollectionData {
                slug: self.slug,
                name: self.name,
                description: self.description,
                image_url: self.image_url,
                safelist_status: self.safelist_status,
                total_supply: self.total_supply,
                num_owners: self.num_owners,
                total_volume: self.total_volume,
                market_cap: self.market_cap,
                floor_price_eth: self.floor_price_eth,
            },
            data_last_fetched_at: self.data_last_fetched_at,
            updated_at: self.updated_at,
        }
    }
}

#[async_trait]
impl CollectionStore for PgStore {
    async fn find_collection_metadata(
        &self,
        slug: &str,
    ) -> Result<Option<CollectionMetadata>, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::seconds(METADATA_TTL_SECONDS);
        let row: Option<DbCollectionRow> = sqlx::query_as(
            "SELECT slug, name, description, image_url, safelist_status, total_supply, \
             num_owners, total_volume, market_cap, floor_price_eth, data_last_fetched_at, \
             updated_at \
             FROM collection_metadata_cache WHERE slug = $1 AND updated_at > $2",
        )
        .bind(slug)
        .bind(cutoff)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(DbCollectionRow::into_metadata))
    }

    async fn upsert_collection_metadata(&self, data: &CollectionData) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO collection_metadata_cache (slug, name, description, image_url, \
             safelist_status, total_supply, num_owners, total_volume, market_cap, \
             floor_price_eth, data_last_fetched_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now(), now()) \
             ON CONFLICT (slug) DO UPDATE SET \
             name = EXCLUDED.name, \
             description = EXCLUDED.description, \
             image_url = EXCLUDED.image_url, \
             safelist_status = EXCLUDED.safelist_status, \
             total_supply = EXCLUDED.total_supply, \
             num_owners = EXCLUDED.num_owners, \
             total_volume = EXCLUDED.total_volume, \
             market_cap = EXCLUDED.market_cap, \
             floor_price_eth = EXCLUDED.floor_price_eth, \
             data_last_fetched_at = now(), \
             updated_at = now()",
        )
        .bind(&data.slug)
        .bind(&data.name)
        .bind(&data.description)
        .bind(&data.image_url)
        .bind(&data.safelist_status)
        .bind(data.total_supply)
        .bind(data.num_owners)
        .bind(data.total_volume)
        .bind(data.market_cap)
        .bind(data.floor_price_eth)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
