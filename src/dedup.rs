//! Deduplication / Upsert Module
//!
//! Converges repeated scrapes onto one row per `(source_name, source_url)`:
//! - Canonical URL normalization so tracking parameters never split identity
//! - Last-wins collapsing of duplicate keys inside one batch
//! - Insert vs. update planning against the rows already persisted

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use url::Url;

use crate::error::Result;
use crate::metrics;
use crate::schemas::{ListingKey, ListingRow, ScrapedRecord};
use crate::storage::{ExistingListing, ListingStore, UpsertOp};

/// Query parameters that only carry tracking state
const TRACKING_PARAMS: &[&str] = &[
    "utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content",
    "fbclid", "gclid", "msclkid", "mc_cid", "mc_eid", "_ga", "_gl", "yclid", "twclid",
    "mkevt", "mkcid", "mkrid", "campid", "customid", "toolid", "_trkparms", "_trksid",
];

/// Normalizes URL to canonical form
/// - Removes fragments (#...)
/// - Removes tracking parameters (utm_*, fbclid, eBay affiliate params, ...)
/// - Lowercase scheme and host
/// - Sorts query parameters
pub fn canonicalize_url(url_str: &str) -> std::result::Result<String, url::ParseError> {
    let mut url = Url::parse(url_str.trim())?;

    url.set_fragment(None);

    let tracking: HashSet<&str> = TRACKING_PARAMS.iter().copied().collect();
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !tracking.contains(key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.set_query(None);
    if !params.is_empty() {
        params.sort();
        url.query_pairs_mut().extend_pairs(params);
    }

    Ok(url.to_string())
}

/// Collapses duplicate keys inside one batch. The later occurrence replaces
/// the earlier one in place, so first-seen order is kept and the result is
/// deterministic for a given adapter order. Returns the number of records
/// that were superseded.
pub fn collapse_batch(records: Vec<ScrapedRecord>) -> (Vec<ScrapedRecord>, usize) {
    let mut positions: HashMap<ListingKey, usize> = HashMap::with_capacity(records.len());
    let mut unique: Vec<ScrapedRecord> = Vec::with_capacity(records.len());
    let mut superseded = 0;

    for record in records {
        match positions.get(&record.key()) {
            Some(&index) => {
                debug!(key = %record.key(), "Duplicate key in batch, later record wins");
                unique[index] = record;
                superseded += 1;
            }
            None => {
                positions.insert(record.key(), unique.len());
                unique.push(record);
            }
        }
    }

    (unique, superseded)
}

/// Persistence operations decided for one batch
#[derive(Debug, Default)]
pub struct UpsertPlan {
    pub ops: Vec<UpsertOp>,
    pub superseded: usize,
}

impl UpsertPlan {
    pub fn inserts(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, UpsertOp::Insert(_))).count()
    }

    pub fn updates(&self) -> usize {
        self.ops.iter().filter(|op| matches!(op, UpsertOp::Update { .. })).count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
    pub superseded: usize,
    pub persisted: usize,
}

/// Resolves validated records against persisted state
#[derive(Debug, Default, Clone)]
pub struct UpsertEngine;

impl UpsertEngine {
    pub fn new() -> Self {
        Self
    }

    /// Plans one operation per unique key: an insert with a fresh identity
    /// when no row exists, otherwise an update of the row's mutable fields.
    pub fn plan(
        &self,
        records: Vec<ScrapedRecord>,
        existing: &HashMap<ListingKey, ExistingListing>,
        now: DateTime<Utc>,
    ) -> UpsertPlan {
        let (unique, superseded) = collapse_batch(records);

        let ops = unique
            .into_iter()
            .map(|record| match existing.get(&record.key()) {
                Some(current) => UpsertOp::Update {
                    id: current.id,
                    record,
                    scraped_at: now,
                },
                None => UpsertOp::Insert(ListingRow {
                    id: uuid::Uuid::new_v4(),
                    record,
                    created_at: now,
                    updated_at: now,
                    scraped_at: now,
                    verified: false,
                }),
            })
            .collect();

        UpsertPlan { ops, superseded }
    }

    /// Looks up the batch's keys, plans, and commits the whole batch through
    /// the store in one all-or-nothing call.
    pub async fn upsert(&self, store: &dyn ListingStore, records: Vec<ScrapedRecord>) -> Result<UpsertSummary> {
        if records.is_empty() {
            return Ok(UpsertSummary::default());
        }

        let mut keys: Vec<ListingKey> = records.iter().map(ScrapedRecord::key).collect();
        keys.sort();
        keys.dedup();

        let existing = store.lookup(&keys).await?;
        let plan = self.plan(records, &existing, Utc::now());
        let (inserted, updated) = (plan.inserts(), plan.updates());

        let persisted = store.apply(&plan.ops).await?;

        metrics::record_persisted("insert", inserted as u64);
        metrics::record_persisted("update", updated as u64);
        info!(
            backend = store.backend(),
            inserted,
            updated,
            superseded = plan.superseded,
            persisted,
            "Batch committed"
        );

        Ok(UpsertSummary {
            inserted,
            updated,
            superseded: plan.superseded,
            persisted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryListingStore;

    fn record(source: &str, url: &str, price: f64) -> ScrapedRecord {
        ScrapedRecord::new(source, url, "Pokemon Booster Box", price, "tcg")
    }

    #[test]
    fn test_canonicalize_url() {
        // Remove tracking params
        let url = "https://www.ebay.it/itm/1234?utm_source=twitter&mkevt=1&var=5";
        assert_eq!(canonicalize_url(url).unwrap(), "https://www.ebay.it/itm/1234?var=5");

        // Remove fragment
        let url = "https://example.com/page#section";
        assert_eq!(canonicalize_url(url).unwrap(), "https://example.com/page");

        // Sort params, keep path case
        let url = "HTTPS://Example.COM/Cards/SV01?z=last&a=first";
        assert_eq!(canonicalize_url(url).unwrap(), "https://example.com/Cards/SV01?a=first&z=last");

        assert!(canonicalize_url("not a url").is_err());
    }

    #[test]
    fn test_collapse_batch_last_wins() {
        let batch = vec![
            record("ebay", "https://ebay.it/itm/1", 100.0),
            record("ebay", "https://ebay.it/itm/2", 50.0),
            record("ebay", "https://ebay.it/itm/1", 90.0),
        ];

        let (unique, superseded) = collapse_batch(batch);

        assert_eq!(superseded, 1);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].source_url, "https://ebay.it/itm/1");
        assert_eq!(unique[0].price_eur, 90.0);
        assert_eq!(unique[1].price_eur, 50.0);
    }

    #[test]
    fn test_same_url_different_sources_are_distinct() {
        let batch = vec![
            record("ebay", "https://shared.example/1", 10.0),
            record("tcgdex", "https://shared.example/1", 12.0),
        ];
        let (unique, superseded) = collapse_batch(batch);
        assert_eq!(unique.len(), 2);
        assert_eq!(superseded, 0);
    }

    #[test]
    fn test_plan_insert_and_update() {
        let engine = UpsertEngine::new();
        let known = ListingKey::new("tcgdex", "https://api.tcgdex.net/v2/it/cards/swsh3-136");
        let existing_id = uuid::Uuid::new_v4();
        let created_at = Utc::now() - chrono::Duration::days(3);
        let existing = HashMap::from([(
            known.clone(),
            ExistingListing { id: existing_id, created_at },
        )]);

        let now = Utc::now();
        let plan = engine.plan(
            vec![
                record("tcgdex", &known.source_url, 25.0),
                record("tcgdex", "https://api.tcgdex.net/v2/it/cards/swsh3-137", 3.0),
            ],
            &existing,
            now,
        );

        assert_eq!(plan.updates(), 1);
        assert_eq!(plan.inserts(), 1);
        match &plan.ops[0] {
            UpsertOp::Update { id, record, scraped_at } => {
                assert_eq!(*id, existing_id);
                assert_eq!(record.price_eur, 25.0);
                assert_eq!(*scraped_at, now);
            }
            other => panic!("expected update, got {:?}", other),
        }
        match &plan.ops[1] {
            UpsertOp::Insert(row) => {
                assert_ne!(row.id, existing_id);
                assert_eq!(row.scraped_at, now);
                assert!(!row.verified);
            }
            other => panic!("expected insert, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_upsert_twice_converges_to_latest_price() {
        let store = MemoryListingStore::new();
        let engine = UpsertEngine::new();

        let first = engine
            .upsert(&store, vec![record("ebay", "https://ebay.it/itm/9", 100.0)])
            .await
            .unwrap();
        assert_eq!(first.inserted, 1);

        let second = engine
            .upsert(&store, vec![record("ebay", "https://ebay.it/itm/9", 80.0)])
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);

        assert_eq!(store.count().await.unwrap(), 1);
        let row = store
            .get(&ListingKey::new("ebay", "https://ebay.it/itm/9"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.record.price_eur, 80.0);
    }

    #[tokio::test]
    async fn test_empty_batch_touches_nothing() {
        let store = MemoryListingStore::new();
        let summary = UpsertEngine::new().upsert(&store, vec![]).await.unwrap();
        assert_eq!(summary, UpsertSummary::default());
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
