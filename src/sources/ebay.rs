//! eBay Data Source
//!
//! Fetches marketplace listings from the eBay Browse API
//! https://developer.ebay.com/api-docs/buy/browse/resources/item_summary/methods/search

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::Source;
use crate::config::Config;
use crate::error::Result;
use crate::http_client::SourceHttpClient;
use crate::schemas::{Condition, ScrapedRecord, SourceDescriptor};

pub const SOURCE_NAME: &str = "ebay";

/// Largest page the Browse API serves
const MAX_PAGE_SIZE: u32 = 200;
/// Page size used for category pagination
const CATEGORY_PAGE_SIZE: u32 = 50;

/// Hub category -> eBay category id
const CATEGORY_IDS: &[(&str, &str)] = &[
    ("tcg", "2536"),    // Collectible Card Games
    ("retro", "139971"), // Video Game Consoles
    ("comics", "259104"), // Comics & Graphic Novels
];

/// Browse API response structures
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    /// Absent on some responses; paging then relies on empty pages and limits
    total: Option<u32>,
    #[serde(default)]
    item_summaries: Vec<ItemSummary>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSummary {
    pub item_id: String,
    #[serde(default)]
    pub title: String,
    pub short_description: Option<String>,
    pub price: Option<Amount>,
    pub condition: Option<String>,
    pub item_web_url: Option<String>,
    pub item_location: Option<ItemLocation>,
    #[serde(default)]
    pub shipping_options: Vec<ShippingOption>,
    #[serde(default)]
    pub categories: Vec<ItemCategory>,
    pub image: Option<Image>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Amount {
    pub value: String,
    pub currency: String,
}

impl Amount {
    /// Value in euro; other currencies are not converted
    fn eur(&self) -> Option<f64> {
        if self.currency != "EUR" {
            return None;
        }
        self.value.parse().ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemLocation {
    pub city: Option<String>,
    pub state_or_province: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingOption {
    pub shipping_cost: Option<Amount>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemCategory {
    pub category_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub image_url: String,
}

/// eBay Browse API source
pub struct EbaySource {
    client: SourceHttpClient,
    descriptor: SourceDescriptor,
    token: String,
    marketplace_id: String,
}

impl EbaySource {
    pub fn from_config(config: &Config, client: SourceHttpClient) -> Self {
        let interval = Duration::from_millis(config.ebay_rate_limit_ms);
        let descriptor = if config.has_ebay() {
            SourceDescriptor::enabled(SOURCE_NAME, &config.ebay_api_url, interval)
        } else {
            SourceDescriptor::disabled(
                SOURCE_NAME,
                &config.ebay_api_url,
                interval,
                "EBAY_OAUTH_TOKEN not set",
            )
        };

        Self {
            client,
            descriptor,
            token: config.ebay_oauth_token.clone().unwrap_or_default(),
            marketplace_id: config.ebay_marketplace_id.clone(),
        }
    }

    fn category_id(category: &str) -> Option<&'static str> {
        CATEGORY_IDS
            .iter()
            .find(|(hub, _)| *hub == category)
            .map(|(_, id)| *id)
    }

    fn hub_for(item: &ItemSummary) -> &'static str {
        item.categories
            .iter()
            .find_map(|c| CATEGORY_IDS.iter().find(|(_, id)| *id == c.category_id))
            .map_or("other", |(hub, _)| *hub)
    }

    /// Fetches one page of search results
    async fn search_page(&self, mut params: Vec<(&str, String)>, limit: u32, offset: u32) -> Result<SearchResponse> {
        params.push(("limit", limit.to_string()));
        params.push(("offset", offset.to_string()));

        let url = format!("{}/item_summary/search", self.descriptor.base_url);
        let headers = [
            ("Authorization", format!("Bearer {}", self.token)),
            ("X-EBAY-C-MARKETPLACE-ID", self.marketplace_id.clone()),
        ];

        self.client.get_json(&url, &params, &headers).await
    }

    /// Converts an item summary to a listing; items without a euro price
    /// or a web URL are dropped.
    pub fn item_to_record(item: &ItemSummary, category: &str) -> Option<ScrapedRecord> {
        let price = item.price.as_ref().and_then(Amount::eur)?;
        let url = item.item_web_url.as_deref()?;

        let shipping = item
            .shipping_options
            .iter()
            .filter_map(|option| option.shipping_cost.as_ref().and_then(Amount::eur))
            .fold(None, |cheapest: Option<f64>, cost| Some(cheapest.map_or(cost, |c| c.min(cost))))
            .unwrap_or(0.0);

        let location = item.item_location.as_ref();
        let mut record = ScrapedRecord::new(SOURCE_NAME, url, item.title.trim(), price, category)
            .description(item.short_description.clone().unwrap_or_default())
            .condition(Condition::parse_lenient(item.condition.as_deref().unwrap_or_default()))
            .region(location.and_then(|l| l.state_or_province.clone()).unwrap_or_default())
            .city(location.and_then(|l| l.city.clone()))
            .shipping_cost(shipping)
            .meta("ebay_item_id", item.item_id.clone());

        if let Some(ref image) = item.image {
            record = record.meta("image_url", image.image_url.clone());
        }

        Some(record)
    }
}

#[async_trait]
impl Source for EbaySource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch_by_category(&self, category: &str, max_pages: u32) -> Result<Vec<ScrapedRecord>> {
        let Some(category_id) = Self::category_id(category) else {
            debug!(category = %category, "No eBay category for hub, skipping");
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for page in 0..max_pages {
            let offset = page * CATEGORY_PAGE_SIZE;
            let response = self
                .search_page(vec![("category_ids", category_id.to_string())], CATEGORY_PAGE_SIZE, offset)
                .await?;

            if response.item_summaries.is_empty() {
                break;
            }

            let seen = response.item_summaries.len() as u32;
            records.extend(
                response
                    .item_summaries
                    .iter()
                    .filter_map(|item| Self::item_to_record(item, category)),
            );

            if response.total.is_some_and(|total| offset + seen >= total) {
                break;
            }
        }

        info!(category = %category, count = records.len(), "Fetched eBay listings");
        Ok(records)
    }

    async fn fetch_by_search(&self, query: &str, max_results: u32) -> Result<Vec<ScrapedRecord>> {
        let mut records = Vec::new();
        let mut offset = 0;

        // Bounded by items seen, not kept, so dropped items cannot extend paging
        while offset < max_results {
            let limit = (max_results - offset).min(MAX_PAGE_SIZE);
            let response = self.search_page(vec![("q", query.to_string())], limit, offset).await?;

            if response.item_summaries.is_empty() {
                break;
            }

            let seen = response.item_summaries.len() as u32;
            records.extend(
                response
                    .item_summaries
                    .iter()
                    .filter_map(|item| Self::item_to_record(item, Self::hub_for(item))),
            );

            offset += seen;
            if response.total.is_some_and(|total| offset >= total) {
                break;
            }
        }

        records.truncate(max_results as usize);
        info!(query = %query, count = records.len(), "Searched eBay listings");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(json: serde_json::Value) -> ItemSummary {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_item_to_record() {
        let summary = item(serde_json::json!({
            "itemId": "v1|1234|0",
            "title": " Game Boy Color Atomic Purple ",
            "price": { "value": "89.90", "currency": "EUR" },
            "condition": "Usato",
            "itemWebUrl": "https://www.ebay.it/itm/1234?mkevt=1&mkcid=1",
            "itemLocation": { "city": "Torino", "stateOrProvince": "Piemonte", "country": "IT" },
            "shippingOptions": [
                { "shippingCost": { "value": "9.00", "currency": "EUR" } },
                { "shippingCost": { "value": "6.50", "currency": "EUR" } }
            ],
            "categories": [{ "categoryId": "139971" }]
        }));

        let record = EbaySource::item_to_record(&summary, EbaySource::hub_for(&summary)).unwrap();

        assert_eq!(record.source_url, "https://www.ebay.it/itm/1234");
        assert_eq!(record.title, "Game Boy Color Atomic Purple");
        assert_eq!(record.price_eur, 89.90);
        assert_eq!(record.condition, Condition::Used);
        assert_eq!(record.region, "Piemonte");
        assert_eq!(record.city.as_deref(), Some("Torino"));
        assert_eq!(record.shipping_cost_eur, 6.5);
        assert_eq!(record.category, "retro");
        assert_eq!(record.metadata["ebay_item_id"], "v1|1234|0");
    }

    #[test]
    fn test_non_euro_items_are_dropped() {
        let summary = item(serde_json::json!({
            "itemId": "v1|99|0",
            "title": "Charizard",
            "price": { "value": "120.00", "currency": "USD" },
            "itemWebUrl": "https://www.ebay.com/itm/99"
        }));
        assert!(EbaySource::item_to_record(&summary, "tcg").is_none());
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(EbaySource::category_id("tcg"), Some("2536"));
        assert_eq!(EbaySource::category_id("vinyl"), None);
    }
}
