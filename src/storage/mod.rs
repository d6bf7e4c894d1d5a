//! Persistence gateway for ingested listings
//!
//! The core only talks to storage through [`ListingStore`]: a keyed lookup of
//! the rows a batch touches, and an all-or-nothing apply of the planned
//! operations.

mod memory;
mod postgres;

pub use memory::MemoryListingStore;
pub use postgres::PgListingStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::schemas::{ListingKey, ListingRow, ScrapedRecord};

/// Identity of a row that already exists for a composite key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingListing {
    pub id: uuid::Uuid,
    pub created_at: DateTime<Utc>,
}

/// One planned write
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOp {
    /// New row; on a key collision the store refreshes the existing row instead
    Insert(ListingRow),
    /// Refresh the mutable fields of an existing row
    Update {
        id: uuid::Uuid,
        record: ScrapedRecord,
        scraped_at: DateTime<Utc>,
    },
}

/// Overwrites the fields a re-scrape is allowed to change. Identity,
/// creation time, location and the verified flag are left alone.
pub fn refresh_row(row: &mut ListingRow, record: &ScrapedRecord, scraped_at: DateTime<Utc>) {
    row.record.title = record.title.clone();
    row.record.description = record.description.clone();
    row.record.price_eur = record.price_eur;
    row.record.condition = record.condition;
    row.record.shipping_cost_eur = record.shipping_cost_eur;
    row.record.metadata = record.metadata.clone();
    row.scraped_at = scraped_at;
    row.updated_at = scraped_at;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Finds the rows that already exist for the given keys
    async fn lookup(&self, keys: &[ListingKey]) -> Result<HashMap<ListingKey, ExistingListing>>;

    /// Applies every operation or none of them. Returns the number of rows
    /// written.
    async fn apply(&self, ops: &[UpsertOp]) -> Result<usize>;

    async fn get(&self, key: &ListingKey) -> Result<Option<ListingRow>>;

    async fn count(&self) -> Result<usize>;
}

/// Opens the configured store: Postgres when `DATABASE_URL` is set,
/// otherwise an in-memory store that lives as long as the process.
pub async fn open_store(config: &Config) -> Result<Arc<dyn ListingStore>> {
    match config.database_url {
        Some(ref url) => {
            let store = PgListingStore::connect(url).await?;
            store.ensure_schema().await?;
            info!("Postgres listing store ready");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database URL configured - listings are kept in memory only");
            Ok(Arc::new(MemoryListingStore::new()))
        }
    }
}
