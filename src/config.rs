//! Configuration for the Ingestion Service

use anyhow::{bail, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Scheduling
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval_secs: u64,
    #[serde(default)]
    pub seed_on_start: bool,
    #[serde(default = "default_adapter_timeout")]
    pub adapter_timeout_secs: u64,

    // What each tick fetches
    #[serde(default = "default_categories")]
    pub scrape_categories: String,
    #[serde(default = "default_max_pages")]
    pub scrape_max_pages: u32,
    #[serde(default)]
    pub search_queries: String,
    #[serde(default = "default_search_max_results")]
    pub search_max_results: u32,

    // Database
    pub database_url: Option<String>,

    // eBay Browse API
    #[serde(default = "default_ebay_api")]
    pub ebay_api_url: String,
    pub ebay_oauth_token: Option<String>,
    #[serde(default = "default_ebay_marketplace")]
    pub ebay_marketplace_id: String,
    #[serde(default = "default_ebay_rate_limit")]
    pub ebay_rate_limit_ms: u64,

    // TCGdex
    #[serde(default = "default_tcgdex_api")]
    pub tcgdex_api_url: String,
    #[serde(default = "default_true")]
    pub tcgdex_enabled: bool,
    #[serde(default = "default_tcgdex_rate_limit")]
    pub tcgdex_rate_limit_ms: u64,

    // Synthetic source
    #[serde(default)]
    pub mock_rate_limit_ms: u64,

    // HTTP
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_global_rate_limit")]
    pub global_rate_limit_rpm: u32,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_http_max_attempts")]
    pub http_max_attempts: u32,
    #[serde(default = "default_http_initial_backoff")]
    pub http_initial_backoff_ms: u64,

    // Circuit breaker
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_open_duration_secs: u64,

    // Metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_scrape_interval() -> u64 {
    1800 // 30 minutes
}

fn default_adapter_timeout() -> u64 {
    120
}

fn default_categories() -> String {
    "tcg,retro,comics".to_string()
}

fn default_max_pages() -> u32 {
    3
}

fn default_search_max_results() -> u32 {
    50
}

fn default_ebay_api() -> String {
    "https://api.ebay.com/buy/browse/v1".to_string()
}

fn default_ebay_marketplace() -> String {
    "EBAY_IT".to_string()
}

fn default_ebay_rate_limit() -> u64 {
    1000
}

fn default_tcgdex_api() -> String {
    "https://api.tcgdex.net/v2/it".to_string()
}

fn default_tcgdex_rate_limit() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_global_rate_limit() -> u32 {
    300
}

fn default_http_timeout() -> u64 {
    30
}

fn default_http_max_attempts() -> u32 {
    3
}

fn default_http_initial_backoff() -> u64 {
    500
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> u64 {
    300
}

fn default_metrics_port() -> u16 {
    9090
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scrape_interval_secs: default_scrape_interval(),
            seed_on_start: false,
            adapter_timeout_secs: default_adapter_timeout(),
            scrape_categories: default_categories(),
            scrape_max_pages: default_max_pages(),
            search_queries: String::new(),
            search_max_results: default_search_max_results(),
            database_url: None,
            ebay_api_url: default_ebay_api(),
            ebay_oauth_token: None,
            ebay_marketplace_id: default_ebay_marketplace(),
            ebay_rate_limit_ms: default_ebay_rate_limit(),
            tcgdex_api_url: default_tcgdex_api(),
            tcgdex_enabled: true,
            tcgdex_rate_limit_ms: default_tcgdex_rate_limit(),
            mock_rate_limit_ms: 0,
            max_concurrent_requests: default_max_concurrent_requests(),
            global_rate_limit_rpm: default_global_rate_limit(),
            http_timeout_secs: default_http_timeout(),
            http_max_attempts: default_http_max_attempts(),
            http_initial_backoff_ms: default_http_initial_backoff(),
            circuit_breaker_failure_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_open_duration_secs: default_circuit_breaker_timeout(),
            metrics_port: default_metrics_port(),
            metrics_enabled: true,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file
        dotenvy::dotenv().ok();

        Self::from_environment(config::Environment::default())
    }

    fn from_environment(environment: config::Environment) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(environment.separator("__").try_parsing(true))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Rejects values that would make the scheduler spin or do nothing
    pub fn validate(&self) -> Result<()> {
        if self.scrape_interval_secs == 0 {
            bail!("SCRAPE_INTERVAL_SECS must be greater than zero");
        }
        if self.adapter_timeout_secs == 0 {
            bail!("ADAPTER_TIMEOUT_SECS must be greater than zero");
        }
        if self.scrape_max_pages == 0 {
            bail!("SCRAPE_MAX_PAGES must be greater than zero");
        }
        if self.http_max_attempts == 0 {
            bail!("HTTP_MAX_ATTEMPTS must be greater than zero");
        }
        if self.category_list().is_empty() && self.search_query_list().is_empty() {
            bail!("at least one of SCRAPE_CATEGORIES or SEARCH_QUERIES must be set");
        }
        Ok(())
    }

    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_secs)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    pub fn category_list(&self) -> Vec<String> {
        split_list(&self.scrape_categories)
    }

    pub fn search_query_list(&self) -> Vec<String> {
        split_list(&self.search_queries)
    }

    /// Checks if eBay credentials are configured
    pub fn has_ebay(&self) -> bool {
        self.ebay_oauth_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }
}
