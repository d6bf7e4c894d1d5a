//! Marketplace sources for ingestion
//!
//! Each source implements the `Source` trait: fetch by hub category
//! (paginated) or by free-text search. Sources that lack required
//! configuration are still built, but report themselves disabled so the
//! scheduler skips them.

pub mod ebay;
pub mod mock;
pub mod tcgdex;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::http_client::{ResilientHttpClient, SourceHttpClient};
use crate::rate_limiter::RateLimiter;
use crate::schemas::{ScrapedRecord, SourceDescriptor};

pub use ebay::EbaySource;
pub use mock::MockSource;
pub use tcgdex::TcgdexSource;

/// Trait for all listing sources
#[async_trait]
pub trait Source: Send + Sync {
    /// Static configuration of this source
    fn descriptor(&self) -> &SourceDescriptor;

    /// Fetches listings of one hub category, at most `max_pages` pages
    async fn fetch_by_category(&self, category: &str, max_pages: u32) -> Result<Vec<ScrapedRecord>>;

    /// Fetches listings matching a free-text query, at most `max_results`
    async fn fetch_by_search(&self, query: &str, max_results: u32) -> Result<Vec<ScrapedRecord>>;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    fn is_enabled(&self) -> bool {
        self.descriptor().enabled
    }
}

/// What every tick asks each source for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub categories: Vec<String>,
    pub max_pages: u32,
    pub queries: Vec<String>,
    pub max_results: u32,
}

impl FetchPlan {
    pub fn from_config(config: &Config) -> Self {
        Self {
            categories: config.category_list(),
            max_pages: config.scrape_max_pages,
            queries: config.search_query_list(),
            max_results: config.search_max_results,
        }
    }

    /// Every category once, no searches
    pub fn categories(categories: &[&str], max_pages: u32) -> Self {
        Self {
            categories: categories.iter().map(|c| c.to_string()).collect(),
            max_pages,
            queries: Vec::new(),
            max_results: 0,
        }
    }
}

/// Runs the whole plan against one source, categories first, then
/// searches. The first error aborts the source, so a failing source
/// contributes nothing rather than a partial result.
pub async fn fetch_plan(source: &dyn Source, plan: &FetchPlan) -> Result<Vec<ScrapedRecord>> {
    let mut records = Vec::new();

    for category in &plan.categories {
        let page = source.fetch_by_category(category, plan.max_pages).await?;
        debug!(source = %source.name(), category = %category, count = page.len(), "Category fetched");
        records.extend(page);
    }

    for query in &plan.queries {
        let found = source.fetch_by_search(query, plan.max_results).await?;
        debug!(source = %source.name(), query = %query, count = found.len(), "Search fetched");
        records.extend(found);
    }

    Ok(records)
}

/// Builds every live marketplace source from configuration and registers
/// each one's spacing with the rate limiter.
pub fn build_sources(
    config: &Config,
    http: Arc<ResilientHttpClient>,
    limiter: Arc<RateLimiter>,
) -> Vec<Arc<dyn Source>> {
    let ebay = EbaySource::from_config(
        config,
        SourceHttpClient::new(http.clone(), limiter.clone(), ebay::SOURCE_NAME),
    );
    let tcgdex = TcgdexSource::from_config(
        config,
        SourceHttpClient::new(http, limiter.clone(), tcgdex::SOURCE_NAME),
    );

    let sources: Vec<Arc<dyn Source>> = vec![Arc::new(ebay), Arc::new(tcgdex)];
    for source in &sources {
        let descriptor = source.descriptor();
        limiter.set_interval(&descriptor.name, descriptor.rate_limit_interval);
        match descriptor.disabled_reason {
            Some(ref reason) => info!(source = %descriptor.name, reason = %reason, "Source disabled"),
            None => info!(
                source = %descriptor.name,
                interval_ms = descriptor.rate_limit_interval.as_millis() as u64,
                "Source enabled"
            ),
        }
    }

    sources
}

/// Builds the synthetic source used by the seed step and the fallback tick
pub fn build_mock(config: &Config, limiter: Arc<RateLimiter>) -> Arc<MockSource> {
    let interval = Duration::from_millis(config.mock_rate_limit_ms);
    limiter.set_interval(mock::SOURCE_NAME, interval);
    Arc::new(MockSource::new(interval, limiter))
}
