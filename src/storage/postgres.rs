//! Postgres listing store

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{ExistingListing, ListingStore, UpsertOp};
use crate::error::{IngestionError, Result};
use crate::schemas::{Condition, ListingKey, ListingMetadata, ListingRow, ScrapedRecord};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id UUID PRIMARY KEY,
        source_url TEXT NOT NULL,
        source_name VARCHAR(20) NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        price_eur DOUBLE PRECISION NOT NULL,
        region TEXT,
        city TEXT,
        condition VARCHAR(20) NOT NULL,
        year INTEGER,
        brand TEXT,
        category VARCHAR(50) NOT NULL,
        shipping_cost DOUBLE PRECISION DEFAULT 0,
        metadata JSONB DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        scraped_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        verified BOOLEAN NOT NULL DEFAULT FALSE,
        CONSTRAINT unique_source UNIQUE (source_url, source_name)
    )
    "#,
    // Tables created before creation time was tracked
    "ALTER TABLE products ADD COLUMN IF NOT EXISTS created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()",
    // Location and brand come verbatim from sources and have no fixed width
    "ALTER TABLE products ALTER COLUMN region TYPE TEXT, ALTER COLUMN city TYPE TEXT, ALTER COLUMN brand TYPE TEXT",
    "CREATE INDEX IF NOT EXISTS idx_products_category ON products (category)",
];

const SELECT_COLUMNS: &str = "id, source_url, source_name, title, description, price_eur, region, city, \
     condition, year, brand, category, shipping_cost, metadata, created_at, updated_at, scraped_at, verified";

/// Listing store backed by the `products` table
#[derive(Clone)]
pub struct PgListingStore {
    db: PgPool,
}

impl PgListingStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");

        let db = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        Ok(Self { db })
    }

    /// Creates the table and its unique key when missing
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.db).await?;
        }
        Ok(())
    }

    fn row_from_pg(row: &PgRow) -> Result<ListingRow> {
        let condition: String = row.try_get("condition")?;
        let metadata: Option<Json<ListingMetadata>> = row.try_get("metadata")?;
        let description: Option<String> = row.try_get("description")?;
        let region: Option<String> = row.try_get("region")?;
        let shipping: Option<f64> = row.try_get("shipping_cost")?;

        Ok(ListingRow {
            id: row.try_get("id")?,
            record: ScrapedRecord {
                source_url: row.try_get("source_url")?,
                source_name: row.try_get("source_name")?,
                title: row.try_get("title")?,
                description: description.unwrap_or_default(),
                price_eur: row.try_get("price_eur")?,
                region: region.unwrap_or_default(),
                city: row.try_get("city")?,
                condition: Condition::parse_lenient(&condition),
                year: row.try_get("year")?,
                brand: row.try_get("brand")?,
                category: row.try_get("category")?,
                shipping_cost_eur: shipping.unwrap_or_default(),
                metadata: metadata.map(|m| m.0).unwrap_or_default(),
            },
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            scraped_at: row.try_get("scraped_at")?,
            verified: row.try_get("verified")?,
        })
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn lookup(&self, keys: &[ListingKey]) -> Result<HashMap<ListingKey, ExistingListing>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let names: Vec<&str> = keys.iter().map(|k| k.source_name.as_str()).collect();
        let urls: Vec<&str> = keys.iter().map(|k| k.source_url.as_str()).collect();

        let rows = sqlx::query(
            r#"
            SELECT p.id, p.source_name, p.source_url, p.created_at
            FROM products p
            JOIN UNNEST($1::text[], $2::text[]) AS k(source_name, source_url)
              ON p.source_name = k.source_name AND p.source_url = k.source_url
            "#,
        )
        .bind(&names)
        .bind(&urls)
        .fetch_all(&self.db)
        .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let key = ListingKey::new(
                row.try_get::<String, _>("source_name")?,
                row.try_get::<String, _>("source_url")?,
            );
            found.insert(
                key,
                ExistingListing {
                    id: row.try_get("id")?,
                    created_at: row.try_get("created_at")?,
                },
            );
        }

        debug!(requested = keys.len(), found = found.len(), "Looked up existing listings");
        Ok(found)
    }

    async fn apply(&self, ops: &[UpsertOp]) -> Result<usize> {
        let mut tx = self.db.begin().await?;

        for op in ops {
            match op {
                UpsertOp::Insert(row) => {
                    let record = &row.record;
                    sqlx::query(
                        r#"
                        INSERT INTO products (id, source_url, source_name, title, description, price_eur,
                            region, city, condition, year, brand, category, shipping_cost, metadata,
                            created_at, updated_at, scraped_at, verified)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                        ON CONFLICT (source_url, source_name) DO UPDATE SET
                            title = EXCLUDED.title,
                            description = EXCLUDED.description,
                            price_eur = EXCLUDED.price_eur,
                            condition = EXCLUDED.condition,
                            shipping_cost = EXCLUDED.shipping_cost,
                            metadata = EXCLUDED.metadata,
                            updated_at = EXCLUDED.scraped_at,
                            scraped_at = EXCLUDED.scraped_at
                        "#,
                    )
                    .bind(row.id)
                    .bind(&record.source_url)
                    .bind(&record.source_name)
                    .bind(&record.title)
                    .bind(&record.description)
                    .bind(record.price_eur)
                    .bind(&record.region)
                    .bind(&record.city)
                    .bind(record.condition.as_str())
                    .bind(record.year)
                    .bind(&record.brand)
                    .bind(&record.category)
                    .bind(record.shipping_cost_eur)
                    .bind(Json(&record.metadata))
                    .bind(row.created_at)
                    .bind(row.updated_at)
                    .bind(row.scraped_at)
                    .bind(row.verified)
                    .execute(&mut *tx)
                    .await?;
                }
                UpsertOp::Update { id, record, scraped_at } => {
                    let result = sqlx::query(
                        r#"
                        UPDATE products SET
                            title = $2,
                            description = $3,
                            price_eur = $4,
                            condition = $5,
                            shipping_cost = $6,
                            metadata = $7,
                            updated_at = $8,
                            scraped_at = $8
                        WHERE id = $1
                        "#,
                    )
                    .bind(*id)
                    .bind(&record.title)
                    .bind(&record.description)
                    .bind(record.price_eur)
                    .bind(record.condition.as_str())
                    .bind(record.shipping_cost_eur)
                    .bind(Json(&record.metadata))
                    .bind(*scraped_at)
                    .execute(&mut *tx)
                    .await?;

                    if result.rows_affected() == 0 {
                        // Dropping the transaction rolls it back
                        return Err(IngestionError::PersistenceError(format!(
                            "listing {} no longer exists",
                            id
                        )));
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(ops.len())
    }

    async fn get(&self, key: &ListingKey) -> Result<Option<ListingRow>> {
        let query = format!(
            "SELECT {} FROM products WHERE source_name = $1 AND source_url = $2",
            SELECT_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(&key.source_name)
            .bind(&key.source_url)
            .fetch_optional(&self.db)
            .await?;

        row.as_ref().map(Self::row_from_pg).transpose()
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products")
            .fetch_one(&self.db)
            .await?;
        Ok(count as usize)
    }
}
