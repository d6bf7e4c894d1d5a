//! Synthetic listings
//!
//! Serves a fixed catalogue of Italian collectibles listings with stable
//! URLs and jittered prices, so the pipeline can run end to end without
//! marketplace credentials. Used by the seed step and the fallback tick.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use super::Source;
use crate::error::Result;
use crate::rate_limiter::RateLimiter;
use crate::schemas::{Condition, ScrapedRecord, SourceDescriptor};

pub const SOURCE_NAME: &str = "mock";
const BASE_URL: &str = "https://mock.piranha.local";
const PAGE_SIZE: usize = 4;

struct Template {
    category: &'static str,
    slug: &'static str,
    title: &'static str,
    brand: &'static str,
    year: Option<i32>,
    base_price: f64,
    condition: Condition,
    meta: &'static [(&'static str, &'static str)],
}

const CATALOGUE: &[Template] = &[
    Template { category: "tcg", slug: "charizard-base-set", title: "Charizard Set Base Holo", brand: "Pokémon", year: Some(1999), base_price: 320.0, condition: Condition::Good, meta: &[("set", "Base Set"), ("rarity", "Holo Rare"), ("grading", "ungraded")] },
    Template { category: "tcg", slug: "pikachu-illustrator-promo", title: "Pikachu Promo Jumbo", brand: "Pokémon", year: Some(2016), base_price: 45.0, condition: Condition::New, meta: &[("set", "Promo"), ("rarity", "Promo")] },
    Template { category: "tcg", slug: "black-lotus-unlimited", title: "Black Lotus Unlimited (proxy)", brand: "Magic: The Gathering", year: Some(1993), base_price: 25.0, condition: Condition::Fair, meta: &[("set", "Unlimited"), ("rarity", "Rare")] },
    Template { category: "tcg", slug: "blue-eyes-lob", title: "Drago Bianco Occhi Blu LOB", brand: "Yu-Gi-Oh!", year: Some(2002), base_price: 60.0, condition: Condition::Used, meta: &[("set", "Legend of Blue Eyes"), ("rarity", "Ultra Rare"), ("grading", "PSA 7")] },
    Template { category: "tcg", slug: "booster-box-evoluzioni", title: "Box 36 buste Evoluzioni a Paldea", brand: "Pokémon", year: Some(2023), base_price: 140.0, condition: Condition::New, meta: &[("set", "Evoluzioni a Paldea"), ("rarity", "Sealed")] },
    Template { category: "retro", slug: "snes-pal-completo", title: "Super Nintendo PAL completo di scatola", brand: "Nintendo", year: Some(1992), base_price: 180.0, condition: Condition::Good, meta: &[("console", "SNES"), ("region", "PAL"), ("completeness", "CIB")] },
    Template { category: "retro", slug: "game-boy-dmg", title: "Game Boy DMG-01 funzionante", brand: "Nintendo", year: Some(1989), base_price: 75.0, condition: Condition::Used, meta: &[("console", "Game Boy"), ("region", "PAL"), ("completeness", "loose")] },
    Template { category: "retro", slug: "mega-drive-sonic", title: "Sega Mega Drive + Sonic the Hedgehog", brand: "Sega", year: Some(1991), base_price: 95.0, condition: Condition::Fair, meta: &[("console", "Mega Drive"), ("region", "PAL"), ("completeness", "boxed")] },
    Template { category: "retro", slug: "ps1-ff7", title: "Final Fantasy VII PS1 versione italiana", brand: "Sony", year: Some(1997), base_price: 40.0, condition: Condition::Good, meta: &[("console", "PlayStation"), ("region", "PAL"), ("completeness", "CIB")] },
    Template { category: "comics", slug: "dylan-dog-1", title: "Dylan Dog n.1 L'alba dei morti viventi", brand: "Sergio Bonelli Editore", year: Some(1986), base_price: 230.0, condition: Condition::Good, meta: &[("publisher", "Bonelli"), ("era", "1980s"), ("first_edition", "true")] },
    Template { category: "comics", slug: "tex-100", title: "Tex n.100 originale", brand: "Sergio Bonelli Editore", year: Some(1969), base_price: 55.0, condition: Condition::Fair, meta: &[("publisher", "Bonelli"), ("era", "1960s")] },
    Template { category: "comics", slug: "one-piece-1", title: "One Piece n.1 prima edizione Star Comics", brand: "Star Comics", year: Some(2001), base_price: 38.0, condition: Condition::Used, meta: &[("publisher", "Star Comics"), ("era", "2000s"), ("first_edition", "true")] },
    Template { category: "comics", slug: "uomo-ragno-1", title: "L'Uomo Ragno n.1 Editoriale Corno", brand: "Editoriale Corno", year: Some(1970), base_price: 420.0, condition: Condition::Fair, meta: &[("publisher", "Marvel"), ("era", "1970s"), ("first_edition", "true")] },
];

const LOCATIONS: &[(&str, &str)] = &[
    ("Lombardia", "Milano"),
    ("Lazio", "Roma"),
    ("Campania", "Napoli"),
    ("Piemonte", "Torino"),
    ("Emilia-Romagna", "Bologna"),
    ("Toscana", "Firenze"),
    ("Veneto", "Venezia"),
    ("Sicilia", "Palermo"),
];

/// Synthetic source; always enabled
pub struct MockSource {
    descriptor: SourceDescriptor,
    limiter: Arc<RateLimiter>,
}

impl MockSource {
    pub fn new(interval: Duration, limiter: Arc<RateLimiter>) -> Self {
        Self {
            descriptor: SourceDescriptor::enabled(SOURCE_NAME, BASE_URL, interval),
            limiter,
        }
    }

    fn listing(template: &Template, index: usize) -> ScrapedRecord {
        let mut rng = rand::thread_rng();
        // +/- 15% around the catalogue price
        let price = (template.base_price * rng.gen_range(0.85..1.15) * 100.0).round() / 100.0;
        let (region, city) = LOCATIONS[index % LOCATIONS.len()];
        let shipping = if rng.gen_bool(0.3) { 0.0 } else { 6.9 };

        let url = format!("{}/{}/{}", BASE_URL, template.category, template.slug);
        let mut record = ScrapedRecord::new(SOURCE_NAME, &url, template.title, price, template.category)
            .description(format!("{} - spedizione da {}", template.title, city))
            .region(region)
            .city(Some(city.to_string()))
            .condition(template.condition)
            .year(template.year)
            .brand(Some(template.brand.to_string()))
            .shipping_cost(shipping);

        for (key, value) in template.meta {
            record = record.meta(key, *value);
        }
        record
    }
}

#[async_trait]
impl Source for MockSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn fetch_by_category(&self, category: &str, max_pages: u32) -> Result<Vec<ScrapedRecord>> {
        let templates: Vec<(usize, &Template)> = CATALOGUE
            .iter()
            .enumerate()
            .filter(|(_, t)| t.category == category)
            .collect();

        let mut records = Vec::new();
        for page in templates.chunks(PAGE_SIZE).take(max_pages as usize) {
            self.limiter.wait(SOURCE_NAME).await?;
            records.extend(page.iter().map(|(index, template)| Self::listing(template, *index)));
        }
        Ok(records)
    }

    async fn fetch_by_search(&self, query: &str, max_results: u32) -> Result<Vec<ScrapedRecord>> {
        self.limiter.wait(SOURCE_NAME).await?;

        let needle = query.trim().to_lowercase();
        Ok(CATALOGUE
            .iter()
            .enumerate()
            .filter(|(_, t)| !needle.is_empty() && t.title.to_lowercase().contains(&needle))
            .take(max_results as usize)
            .map(|(index, template)| Self::listing(template, index))
            .collect())
    }
}
