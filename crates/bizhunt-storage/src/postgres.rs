//! Postgres-backed listing store.

use std::collections::HashSet;

use async_trait::async_trait;
use bizhunt_core::{Listing, ListingId, PersistenceError, ScraperRun};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::listings::ListingStore;

fn backend(err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PersistenceError::Unavailable(err.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            PersistenceError::Serialization(err.to_string())
        }
        other => PersistenceError::Backend(other.to_string()),
    }
}

fn count(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn get(&self, listing_id: ListingId) -> Result<Option<Listing>, PersistenceError> {
        let row = sqlx::query("SELECT record FROM listings WHERE listing_id = $1")
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| row.try_get::<Json<Listing>, _>("record").map(|json| json.0))
            .transpose()
            .map_err(backend)
    }

    async fn upsert(&self, listing: &Listing) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO listings (
                listing_id, source, source_url, title,
                asking_price, revenue, profit, cash_flow,
                data_completeness_score, is_active,
                first_seen, last_updated, last_verified, record
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (listing_id) DO UPDATE SET
                source_url = EXCLUDED.source_url,
                title = EXCLUDED.title,
                asking_price = EXCLUDED.asking_price,
                revenue = EXCLUDED.revenue,
                profit = EXCLUDED.profit,
                cash_flow = EXCLUDED.cash_flow,
                data_completeness_score = EXCLUDED.data_completeness_score,
                is_active = EXCLUDED.is_active,
                first_seen = EXCLUDED.first_seen,
                last_updated = EXCLUDED.last_updated,
                last_verified = EXCLUDED.last_verified,
                record = EXCLUDED.record
            "#,
        )
        .bind(listing.listing_id)
        .bind(&listing.source)
        .bind(&listing.source_url)
        .bind(&listing.title)
        .bind(listing.asking_price.value)
        .bind(listing.revenue.value)
        .bind(listing.profit.value)
        .bind(listing.cash_flow.value)
        .bind(listing.data_completeness_score)
        .bind(listing.is_active)
        .bind(listing.first_seen)
        .bind(listing.last_updated)
        .bind(listing.last_verified)
        .bind(Json(listing))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn mark_inactive_except(
        &self,
        source: &str,
        seen: &HashSet<ListingId>,
    ) -> Result<usize, PersistenceError> {
        let seen: Vec<Uuid> = seen.iter().copied().collect();
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET is_active = FALSE,
                   record = jsonb_set(record, '{is_active}', 'false'::jsonb)
             WHERE source = $1
               AND is_active
               AND NOT (listing_id = ANY($2))
            "#,
        )
        .bind(source)
        .bind(&seen)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_by_source(&self, source: &str) -> Result<Vec<Listing>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT record
              FROM listings
             WHERE source = $1
             ORDER BY source_url
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| row.try_get::<Json<Listing>, _>("record").map(|json| json.0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)
    }

    async fn record_run(&self, run: &ScraperRun) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO scraper_runs (
                run_id, source, start_time, end_time, status,
                total_found, new_listings, updated_listings, deactivated_listings,
                error_count, report
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (run_id) DO UPDATE SET
                end_time = EXCLUDED.end_time,
                status = EXCLUDED.status,
                total_found = EXCLUDED.total_found,
                new_listings = EXCLUDED.new_listings,
                updated_listings = EXCLUDED.updated_listings,
                deactivated_listings = EXCLUDED.deactivated_listings,
                error_count = EXCLUDED.error_count,
                report = EXCLUDED.report
            "#,
        )
        .bind(run.run_id)
        .bind(&run.source)
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(run.status.to_string())
        .bind(count(run.total_found))
        .bind(count(run.new))
        .bind(count(run.updated))
        .bind(count(run.deactivated))
        .bind(count(run.error_count))
        .bind(Json(run))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<ScraperRun>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT report
              FROM scraper_runs
             ORDER BY start_time DESC
             LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| row.try_get::<Json<ScraperRun>, _>("report").map(|json| json.0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ScraperRun>, PersistenceError> {
        let row = sqlx::query("SELECT report FROM scraper_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|row| row.try_get::<Json<ScraperRun>, _>("report").map(|json| json.0))
            .transpose()
            .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_surface_as_unavailable() {
        assert!(matches!(
            backend(sqlx::Error::PoolTimedOut),
            PersistenceError::Unavailable(_)
        ));
        assert!(matches!(
            backend(sqlx::Error::RowNotFound),
            PersistenceError::Backend(_)
        ));
    }

    #[test]
    fn counters_saturate_at_i32() {
        assert_eq!(count(12), 12);
        assert_eq!(count(usize::MAX), i32::MAX);
    }
}
