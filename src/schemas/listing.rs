//! Listing Schema
//!
//! Normalized marketplace listing produced by every source adapter, and the
//! persisted row shape it converges into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::dedup::canonicalize_url;

/// Hub attributes (set, rarity, console, publisher, ...)
pub type ListingMetadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    New,
    Good,
    Fair,
    Used,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::New => "new",
            Condition::Good => "good",
            Condition::Fair => "fair",
            Condition::Used => "used",
        }
    }

    /// Maps the free-form vocabularies used by marketplaces (Italian and
    /// English) onto the four known conditions. Unknown labels become `Used`.
    pub fn parse_lenient(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        if label.is_empty() {
            return Condition::Used;
        }

        if label.contains("like new") || label.contains("come nuovo") || label.contains("ottimo") {
            return Condition::Good;
        }
        if label.starts_with("new") || label.starts_with("nuovo") || label == "mint" || label == "sealed" {
            return Condition::New;
        }
        if label.contains("good") || label.contains("buon") || label.contains("excellent") || label.contains("near mint") {
            return Condition::Good;
        }
        if label.contains("fair") || label.contains("acceptable") || label.contains("discreto") || label.contains("accettabile") {
            return Condition::Fair;
        }
        Condition::Used
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite identity of a listing across scrapes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingKey {
    pub source_name: String,
    pub source_url: String,
}

impl ListingKey {
    pub fn new(source_name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            source_url: source_url.into(),
        }
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_name, self.source_url)
    }
}

/// A listing as produced by a source adapter, before persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedRecord {
    pub source_url: String,
    pub source_name: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "priceEUR")]
    pub price_eur: f64,
    #[serde(default)]
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    pub condition: Condition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    pub category: String,
    #[serde(default, rename = "shippingCostEUR")]
    pub shipping_cost_eur: f64,
    #[serde(default)]
    pub metadata: ListingMetadata,
}

impl ScrapedRecord {
    /// Creates a record with the required fields; optional ones start empty.
    /// The source URL is canonicalized so tracking parameters never split a
    /// listing's identity.
    pub fn new(
        source_name: impl Into<String>,
        source_url: &str,
        title: impl Into<String>,
        price_eur: f64,
        category: impl Into<String>,
    ) -> Self {
        let source_url = canonicalize_url(source_url).unwrap_or_else(|_| source_url.trim().to_string());
        Self {
            source_url,
            source_name: source_name.into(),
            title: title.into(),
            description: String::new(),
            price_eur,
            region: String::new(),
            city: None,
            condition: Condition::Used,
            year: None,
            brand: None,
            category: category.into(),
            shipping_cost_eur: 0.0,
            metadata: ListingMetadata::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn city(mut self, city: Option<String>) -> Self {
        self.city = city.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn year(mut self, year: Option<i32>) -> Self {
        self.year = year;
        self
    }

    pub fn brand(mut self, brand: Option<String>) -> Self {
        self.brand = brand.filter(|b| !b.trim().is_empty());
        self
    }

    pub fn shipping_cost(mut self, cost_eur: f64) -> Self {
        self.shipping_cost_eur = cost_eur.max(0.0);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn key(&self) -> ListingKey {
        ListingKey::new(self.source_name.clone(), self.source_url.clone())
    }
}

/// A persisted listing row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingRow {
    pub id: uuid::Uuid,
    #[serde(flatten)]
    pub record: ScrapedRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
    pub verified: bool,
}

impl ListingRow {
    pub fn key(&self) -> ListingKey {
        self.record.key()
    }
}

/// Static per-adapter configuration, fixed for the process lifetime
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub name: String,
    pub base_url: String,
    pub rate_limit_interval: Duration,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
}

impl SourceDescriptor {
    pub fn enabled(name: &str, base_url: &str, rate_limit_interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limit_interval,
            enabled: true,
            disabled_reason: None,
        }
    }

    pub fn disabled(name: &str, base_url: &str, rate_limit_interval: Duration, reason: impl Into<String>) -> Self {
        Self {
            enabled: false,
            disabled_reason: Some(reason.into()),
            ..Self::enabled(name, base_url, rate_limit_interval)
        }
    }
}
