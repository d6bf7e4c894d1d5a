//! TCGdex Data Source
//!
//! Trading card catalogue with Cardmarket pricing
//! https://tcgdex.dev/rest
//!
//! The card list only carries ids and names, so every listed card costs one
//! more detail request for its price, rarity and set.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::Source;
use crate::config::Config;
use crate::error::Result;
use crate::http_client::SourceHttpClient;
use crate::schemas::{Condition, ScrapedRecord, SourceDescriptor};

pub const SOURCE_NAME: &str = "tcgdex";

/// The only hub this source serves
const CATEGORY: &str = "tcg";
const PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardBrief {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub name: String,
    pub local_id: Option<String>,
    pub rarity: Option<String>,
    pub illustrator: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub set: Option<CardSet>,
    pub pricing: Option<Pricing>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardSet {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pricing {
    pub cardmarket: Option<CardmarketPrice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardmarketPrice {
    pub avg: Option<f64>,
    pub trend: Option<f64>,
}

impl Card {
    /// Cardmarket average, falling back to the trend price
    fn price_eur(&self) -> Option<f64> {
        let cardmarket = self.pricing.as_ref()?.cardmarket.as_ref()?;
        cardmarket
            .avg
            .filter(|p| *p > 0.0)
            .or(cardmarket.trend.filter(|p| *p > 0.0))
    }
}

/// TCGdex card source
pub struct TcgdexSource {
    client: SourceHttpClient,
    descriptor: SourceDescriptor,
}

impl TcgdexSource {
    pub fn from_config(config: &Config, client: SourceHttpClient) -> Self {
        let interval = Duration::from_millis(config.tcgdex_rate_limit_ms);
        let descriptor = if config.tcgdex_enabled {
            SourceDescriptor::enabled(SOURCE_NAME, &config.tcgdex_api_url, interval)
        } else {
            SourceDescriptor::disabled(SOURCE_NAME, &config.tcgdex_api_url, interval, "TCGDEX_ENABLED is false")
        };

        Self { client, descriptor }
    }

    async fn list_cards(&self, params: Vec<(&str, String)>) -> Result<Vec<CardBrief>> {
        let url = format!("{}/cards", self.descriptor.base_url);
        self.client.get_json(&url, &params, &[]).await
    }

    async fn card(&self, id: &str) -> Result<Card> {
        let url = self.card_url(id);
        self.client.get_json(&url, &[], &[]).await
    }

    fn card_url(&self, id: &str) -> String {
        format!("{}/cards/{}", self.descriptor.base_url, id)
    }

    /// Resolves every brief into a priced listing. Cards without a
    /// Cardmarket price are skipped.
    async fn resolve(&self, briefs: &[CardBrief]) -> Result<Vec<ScrapedRecord>> {
        let mut records = Vec::with_capacity(briefs.len());
        for brief in briefs {
            let card = self.card(&brief.id).await?;
            match self.card_to_record(&card) {
                Some(record) => records.push(record),
                None => debug!(card = %card.id, "No Cardmarket price, skipping"),
            }
        }
        Ok(records)
    }

    pub fn card_to_record(&self, card: &Card) -> Option<ScrapedRecord> {
        let price = card.price_eur()?;

        let title = match card.set {
            Some(ref set) => format!("{} ({})", card.name, set.name),
            None => card.name.clone(),
        };

        let mut record = ScrapedRecord::new(SOURCE_NAME, &self.card_url(&card.id), title, price, CATEGORY)
            .description(card.description.clone().unwrap_or_default())
            .condition(Condition::New)
            .brand(Some("Pokémon".to_string()));

        if let Some(ref rarity) = card.rarity {
            record = record.meta("rarity", rarity.clone());
        }
        if let Some(ref set) = card.set {
            record = record.meta("set", set.name.clone()).meta("set_id", set.id.clone());
        }
        if let Some(ref local_id) = card.local_id {
            record = record.meta("number", local_id.clone());
        }
        if let Some(ref illustrator) = card.illustrator {
            record = record.meta("illustrator", illustrator.clone());
        }
        if let Some(ref image) = card.image {
            record = record.meta("image_url", image.clone());
        }

        Some(record)
    }
}

#[async_trait]
impl Source for TcgdexSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch_by_category(&self, category: &str, max_pages: u32) -> Result<Vec<ScrapedRecord>> {
        if category != CATEGORY {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for page in 1..=max_pages {
            let briefs = self
                .list_cards(vec![
                    ("pagination:page", page.to_string()),
                    ("pagination:itemsPerPage", PAGE_SIZE.to_string()),
                ])
                .await?;

            if briefs.is_empty() {
                break;
            }
            records.extend(self.resolve(&briefs).await?);
        }

        info!(count = records.len(), "Fetched TCGdex cards");
        Ok(records)
    }

    async fn fetch_by_search(&self, query: &str, max_results: u32) -> Result<Vec<ScrapedRecord>> {
        let mut briefs = self.list_cards(vec![("name", query.to_string())]).await?;
        briefs.truncate(max_results as usize);

        let records = self.resolve(&briefs).await?;
        info!(query = %query, count = records.len(), "Searched TCGdex cards");
        Ok(records)
    }
}
