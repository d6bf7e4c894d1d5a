//! Record validation
//!
//! Structural and business rules a scraped record must meet before it can
//! reach the upsert engine. Validation never fails; it only accepts or
//! rejects.

use crate::schemas::ScrapedRecord;

/// Width of the `source_name` column
pub const MAX_SOURCE_NAME_CHARS: usize = 20;
/// Width of the `category` column
pub const MAX_CATEGORY_CHARS: usize = 50;

/// Why a record was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    EmptyTitle,
    NonPositivePrice,
    EmptyCategory,
    EmptySourceName,
    EmptySourceUrl,
    SourceNameTooLong,
    CategoryTooLong,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::EmptyTitle => "empty title",
            Rejection::NonPositivePrice => "price must be greater than zero",
            Rejection::EmptyCategory => "empty category",
            Rejection::EmptySourceName => "empty source name",
            Rejection::EmptySourceUrl => "empty source url",
            Rejection::SourceNameTooLong => "source name too long",
            Rejection::CategoryTooLong => "category too long",
        }
    }
}

/// Lists every rule the record breaks; empty when the record is valid
pub fn rejections(record: &ScrapedRecord) -> Vec<Rejection> {
    let mut found = Vec::new();

    if record.title.trim().is_empty() {
        found.push(Rejection::EmptyTitle);
    }
    // NaN fails this comparison too
    if !(record.price_eur.is_finite() && record.price_eur > 0.0) {
        found.push(Rejection::NonPositivePrice);
    }
    if record.category.trim().is_empty() {
        found.push(Rejection::EmptyCategory);
    }
    if record.source_name.trim().is_empty() {
        found.push(Rejection::EmptySourceName);
    }
    if record.source_url.trim().is_empty() {
        found.push(Rejection::EmptySourceUrl);
    }
    // Over-width values would fail the whole batch commit, not just this record
    if record.source_name.chars().count() > MAX_SOURCE_NAME_CHARS {
        found.push(Rejection::SourceNameTooLong);
    }
    if record.category.chars().count() > MAX_CATEGORY_CHARS {
        found.push(Rejection::CategoryTooLong);
    }

    found
}

pub fn validate(record: &ScrapedRecord) -> bool {
    rejections(record).is_empty()
}

/// Splits a batch into accepted records and the number rejected
pub fn partition(records: Vec<ScrapedRecord>) -> (Vec<ScrapedRecord>, usize) {
    let before = records.len();
    let accepted: Vec<ScrapedRecord> = records
        .into_iter()
        .filter(|record| {
            let reasons = rejections(record);
            if !reasons.is_empty() {
                tracing::debug!(
                    source = %record.source_name,
                    url = %record.source_url,
                    reasons = ?reasons.iter().map(Rejection::as_str).collect::<Vec<_>>(),
                    "Record rejected"
                );
            }
            reasons.is_empty()
        })
        .collect();

    let rejected = before - accepted.len();
    (accepted, rejected)
}
