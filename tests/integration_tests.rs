//! Integration Tests for the ingestion pipeline
//!
//! Uses wiremock for mocking the marketplace APIs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use piranha_ingestion::config::Config;
use piranha_ingestion::error::IngestionError;
use piranha_ingestion::http_client::{HttpClientConfig, ResilientHttpClient, SourceHttpClient};
use piranha_ingestion::rate_limiter::RateLimiter;
use piranha_ingestion::scheduler::{Scheduler, SchedulerSettings};
use piranha_ingestion::schemas::{ListingKey, SourceStatus, TickTrigger};
use piranha_ingestion::sources::{build_mock, build_sources, ebay, tcgdex, EbaySource, Source, TcgdexSource};
use piranha_ingestion::storage::{ListingStore, MemoryListingStore};

fn test_config(server: &MockServer) -> Config {
    Config {
        ebay_api_url: server.uri(),
        ebay_oauth_token: Some("test-token".to_string()),
        ebay_rate_limit_ms: 0,
        tcgdex_api_url: server.uri(),
        tcgdex_rate_limit_ms: 0,
        http_initial_backoff_ms: 10,
        scrape_categories: "tcg".to_string(),
        scrape_max_pages: 3,
        ..Config::default()
    }
}

fn limiter() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(Duration::ZERO, CancellationToken::new()))
}

fn http(config: &Config) -> Arc<ResilientHttpClient> {
    Arc::new(ResilientHttpClient::new(HttpClientConfig::from_config(config)).unwrap())
}

fn ebay_source(config: &Config) -> EbaySource {
    EbaySource::from_config(config, SourceHttpClient::new(http(config), limiter(), ebay::SOURCE_NAME))
}

fn tcgdex_source(config: &Config) -> TcgdexSource {
    TcgdexSource::from_config(config, SourceHttpClient::new(http(config), limiter(), tcgdex::SOURCE_NAME))
}

fn ebay_item(id: u32, price: &str) -> serde_json::Value {
    json!({
        "itemId": format!("v1|{}|0", id),
        "title": format!("Carta Pokémon #{}", id),
        "price": { "value": price, "currency": "EUR" },
        "condition": "Nuovo",
        "itemWebUrl": format!("https://www.ebay.it/itm/{}?mkevt=1", id),
        "itemLocation": { "city": "Milano", "stateOrProvince": "Lombardia" },
        "categories": [{ "categoryId": "2536" }]
    })
}

async fn mount_tcgdex(server: &MockServer, avg: f64) {
    Mock::given(method("GET"))
        .and(path("/cards"))
        .and(query_param("pagination:page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "swsh3-136", "name": "Furret" }
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cards"))
        .and(query_param("pagination:page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/cards/swsh3-136"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "swsh3-136",
            "localId": "136",
            "name": "Furret",
            "rarity": "Non Comune",
            "set": { "id": "swsh3", "name": "Regno Glaciale" },
            "pricing": { "cardmarket": { "avg": avg, "trend": 0.5 } }
        })))
        .mount(server)
        .await;
}

/// Test offset pagination stops once the reported total is reached
#[tokio::test]
async fn test_ebay_category_pagination() {
    let server = MockServer::start().await;
    let config = test_config(&server);

    Mock::given(method("GET"))
        .and(path("/item_summary/search"))
        .and(query_param("category_ids", "2536"))
        .and(query_param("offset", "0"))
        .and(header("Authorization", "Bearer test-token"))
        .and(header("X-EBAY-C-MARKETPLACE-ID", "EBAY_IT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total": 51,
            "itemSummaries": [ebay_item(1, "10.00"), ebay_item(2, "12.50")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/item_summary/search"))
        .and(query_param("offset", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total": 51,
            "itemSummaries": [ebay_item(3, "7.00")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let records = ebay_source(&config).fetch_by_category("tcg", 3).await.unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].source_url, "https://www.ebay.it/itm/1");
    assert_eq!(records[0].region, "Lombardia");
    assert!(records.iter().all(|r| r.category == "tcg"));
}

/// Test a 503 is retried and the next success is used
#[tokio::test]
async fn test_transient_failure_is_retried() {
    let server = MockServer::start().await;
    let config = test_config(&server);

    Mock::given(method("GET"))
        .and(path("/item_summary/search"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/item_summary/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total": 1,
            "itemSummaries": [ebay_item(9, "99.00")]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let records = ebay_source(&config).fetch_by_search("charizard", 10).await.unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].price_eur, 99.0);
}

/// Test retries stop after the configured attempt count
#[tokio::test]
async fn test_retries_are_bounded() {
    let server = MockServer::start().await;
    let config = test_config(&server);

    Mock::given(method("GET"))
        .and(path("/item_summary/search"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = ebay_source(&config).fetch_by_search("charizard", 10).await.unwrap_err();
    assert!(err.is_transient());
}

/// Test a 401 surfaces as an authentication error without retrying
#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let server = MockServer::start().await;
    let config = test_config(&server);

    Mock::given(method("GET"))
        .and(path("/item_summary/search"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
        .expect(1)
        .mount(&server)
        .await;

    let err = ebay_source(&config).fetch_by_category("tcg", 3).await.unwrap_err();
    assert!(matches!(err, IngestionError::Authentication(_)));
}

/// Test an undecodable body is a parse error
#[tokio::test]
async fn test_malformed_body_is_parse_error() {
    let server = MockServer::start().await;
    let config = test_config(&server);

    Mock::given(method("GET"))
        .and(path("/cards"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = tcgdex_source(&config).fetch_by_category("tcg", 1).await.unwrap_err();
    assert_eq!(err.kind(), "parse");
}

/// Test card list pages are resolved through the detail endpoint
#[tokio::test]
async fn test_tcgdex_cards_are_priced_from_detail() {
    let server = MockServer::start().await;
    let config = test_config(&server);
    mount_tcgdex(&server, 1.25).await;

    let records = tcgdex_source(&config).fetch_by_category("tcg", 3).await.unwrap();

    assert_eq!(records.len(), 1);
    let card = &records[0];
    assert_eq!(card.title, "Furret (Regno Glaciale)");
    assert_eq!(card.price_eur, 1.25);
    assert!(card.source_url.ends_with("/cards/swsh3-136"));
    assert_eq!(card.metadata["number"], "136");
}

/// Test a tick keeps going when one source rejects its credentials, and
/// the second tick converges on the same rows
#[tokio::test]
async fn test_tick_into_memory_store() {
    let server = MockServer::start().await;
    let config = test_config(&server);

    Mock::given(method("GET"))
        .and(path("/item_summary/search"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    mount_tcgdex(&server, 1.25).await;

    let limiter = limiter();
    let store = Arc::new(MemoryListingStore::new());
    let scheduler = Scheduler::new(
        build_sources(&config, http(&config), limiter.clone()),
        build_mock(&config, limiter),
        store.clone(),
        SchedulerSettings::from_config(&config),
        CancellationToken::new(),
    );

    let first = scheduler.tick(TickTrigger::Startup).await;

    assert!(!first.used_fallback);
    assert_eq!(first.inserted, 1);
    assert!(matches!(
        first.outcome("ebay").unwrap().status,
        SourceStatus::Failed { ref kind, .. } if kind == "authentication"
    ));
    assert!(first.outcome("tcgdex").unwrap().is_success());

    let key = ListingKey::new("tcgdex", store.rows()[0].record.source_url.clone());
    let created = store.get(&key).await.unwrap().unwrap();

    let second = scheduler.tick(TickTrigger::Interval).await;

    assert!(matches!(second.outcome("ebay").unwrap().status, SourceStatus::Skipped { .. }));
    assert_eq!(second.updated, 1);
    assert_eq!(store.count().await.unwrap(), 1);

    let refreshed = store.get(&key).await.unwrap().unwrap();
    assert_eq!(refreshed.id, created.id);
    assert_eq!(refreshed.created_at, created.created_at);
}

/// Test search paging counts items seen, so dropped items cannot extend it
#[tokio::test]
async fn test_search_stops_at_max_results_when_items_are_dropped() {
    let server = MockServer::start().await;
    let config = test_config(&server);

    let page: Vec<_> = (1..=10)
        .map(|id| {
            let mut item = ebay_item(id, "15.00");
            item["price"]["currency"] = json!("GBP");
            item
        })
        .collect();

    Mock::given(method("GET"))
        .and(path("/item_summary/search"))
        .and(query_param("q", "charizard"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total": 500,
            "itemSummaries": page
        })))
        .expect(1)
        .mount(&server)
        .await;

    let records = ebay_source(&config).fetch_by_search("charizard", 10).await.unwrap();

    assert!(records.is_empty());
}

/// Test a response without a total keeps paging until an empty page
#[tokio::test]
async fn test_category_paging_without_total() {
    let server = MockServer::start().await;
    let config = test_config(&server);

    for (offset, items) in [
        ("0", json!([ebay_item(1, "10.00"), ebay_item(2, "11.00")])),
        ("50", json!([ebay_item(3, "12.00")])),
        ("100", json!([])),
    ] {
        Mock::given(method("GET"))
            .and(path("/item_summary/search"))
            .and(query_param("offset", offset))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "itemSummaries": items })))
            .expect(1)
            .mount(&server)
            .await;
    }

    let records = ebay_source(&config).fetch_by_category("tcg", 3).await.unwrap();

    assert_eq!(records.len(), 3);
}
