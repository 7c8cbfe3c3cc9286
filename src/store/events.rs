//! Activity-event persistence.

use crate::models::{ActivityEvent, EventAccount, EventNft, EventPayment, EventType};
use crate::store::{EventStore, PgStore, StoreError, UpsertStats};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder};

/// Rows per INSERT statement. Keeps bind counts well under the Postgres
/// limit with our column width.
const UPSERT_CHUNK_SIZE: usize = 200;

const SELECT_COLUMNS: &str = "event_type, created_date, transaction_hash, nft_identifier, \
     nft_collection, nft_contract, nft_display_image_url, nft_image_url, nft_name, payment, \
     from_address, from_user, to_address, to_user, quantity";

#[derive(Debug, FromRow)]
struct DbEventRow {
    event_type: String,
    created_date: i64,
    transaction_hash: String,
    nft_identifier: String,
    nft_collection: String,
    nft_contract: String,
    nft_display_image_url: String,
    nft_image_url: String,
    nft_name: Option<String>,
    payment: Option<Json<EventPayment>>,
    from_address: String,
    from_user: Option<String>,
    to_address: String,
    to_user: Option<String>,
    quantity: i64,
}

impl DbEventRow {
    fn into_event(self) -> Option<ActivityEvent> {
        Some(ActivityEvent {
            event_type: EventType::parse(&self.event_type)?,
            created_date: self.created_date,
            transaction: self.transaction_hash,
            nft: EventNft {
                identifier: self.nft_identifier,
                collection: self.nft_collection,
                contract: self.nft_contract,
                display_image_url: self.nft_display_image_url,
                image_url: self.nft_image_url,
                name: self.nft_name,
            },
            payment: self.payment.map(|p| p.0),
            from_account: EventAccount {
                address: self.from_address,
                user: self.from_user,
            },
            to_account: EventAccount {
                address: self.to_address,
                user: self.to_user,
            },
            quantity: self.quantity,
        })
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn latest_event_for_account(
        &self,
        address: &str,
    ) -> Result<Option<ActivityEvent>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM activity_events \
             WHERE from_address = $1 OR to_address = $1 \
             ORDER BY created_date DESC LIMIT 1"
        );
        let row: Option<DbEventRow> = sqlx::query_as(&sql)
            .bind(address)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.and_then(DbEventRow::into_event))
    }

    async fn count_events_for_account(&self, address: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM activity_events WHERE from_address = $1 OR to_address = $1",
        )
        .bind(address)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    async fn events_for_account_paginated(
        &self,
        address: &str,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<ActivityEvent>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM activity_events \
             WHERE from_address = $1 OR to_address = $1 \
             ORDER BY created_date DESC LIMIT $2 OFFSET $3"
        );
        let rows: Vec<DbEventRow> = sqlx::query_as(&sql)
            .bind(address)
            .bind(limit)
            .bind(skip)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().filter_map(DbEventRow::into_event).collect())
    }

    async fn bulk_upsert_events(&self, events: &[ActivityEvent]) -> Result<UpsertStats, StoreError> {
        if events.is_empty() {
            return Ok(UpsertStats::default());
        }

        let mut inserted = 0u64;
        for chunk in events.chunks(UPSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO activity_events (event_type, created_date, transaction_hash, \
                 nft_identifier, nft_collection, nft_contract, nft_display_image_url, \
                 nft_image_url, nft_name, payment, from_address, from_user, to_address, \
                 to_user, quantity) ",
            );
            builder.push_values(chunk, |mut b, event| {
                b.push_bind(event.event_type.as_str())
                    .push_bind(event.created_date)
                    .push_bind(&event.transaction)
                    .push_bind(&event.nft.identifier)
                    .push_bind(&event.nft.collection)
                    .push_bind(&event.nft.contract)
                    .push_bind(&event.nft.display_image_url)
                    .push_bind(&event.nft.image_url)
                    .push_bind(&event.nft.name)
                    .push_bind(event.payment.clone().map(Json))
                    .push_bind(&event.from_account.address)
                    .push_bind(&event.from_account.user)
                    .push_bind(&event.to_account.address)
                    .push_bind(&event.to_account.user)
                    .push_bind(event.quantity);
            });
            builder.push(
                " ON CONFLICT (transaction_hash, event_type, nft_identifier) DO NOTHING",
            );

            let result = builder.build().execute(self.pool()).await?;
            inserted += result.rows_affected();
        }

        Ok(UpsertStats {
            inserted,
            duplicates: events.len() as u64 - inserted,
        })
    }
}
