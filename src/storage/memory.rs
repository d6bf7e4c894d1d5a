//! In-memory listing store

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{refresh_row, ExistingListing, ListingStore, UpsertOp};
use crate::error::{IngestionError, Result};
use crate::schemas::{ListingKey, ListingRow};

/// Keeps rows in a map keyed by composite key. A batch is applied to a staged
/// copy that replaces the live map only when every operation succeeded.
#[derive(Default)]
pub struct MemoryListingStore {
    rows: RwLock<HashMap<ListingKey, ListingRow>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows, ordered by key
    pub fn rows(&self) -> Vec<ListingRow> {
        let mut rows: Vec<ListingRow> = self.rows.read().values().cloned().collect();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn lookup(&self, keys: &[ListingKey]) -> Result<HashMap<ListingKey, ExistingListing>> {
        let rows = self.rows.read();
        Ok(keys
            .iter()
            .filter_map(|key| {
                rows.get(key).map(|row| {
                    (
                        key.clone(),
                        ExistingListing {
                            id: row.id,
                            created_at: row.created_at,
                        },
                    )
                })
            })
            .collect())
    }

    async fn apply(&self, ops: &[UpsertOp]) -> Result<usize> {
        let mut live = self.rows.write();
        let mut staged = live.clone();

        for op in ops {
            match op {
                UpsertOp::Insert(row) => match staged.get_mut(&row.key()) {
                    Some(current) => refresh_row(current, &row.record, row.scraped_at),
                    None => {
                        staged.insert(row.key(), row.clone());
                    }
                },
                UpsertOp::Update { id, record, scraped_at } => {
                    let current = staged
                        .values_mut()
                        .find(|row| row.id == *id)
                        .ok_or_else(|| {
                            IngestionError::PersistenceError(format!("listing {} no longer exists", id))
                        })?;
                    refresh_row(current, record, *scraped_at);
                }
            }
        }

        *live = staged;
        Ok(ops.len())
    }

    async fn get(&self, key: &ListingKey) -> Result<Option<ListingRow>> {
        Ok(self.rows.read().get(key).cloned())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().len())
    }
}
