//! Piranha Ingestion Service
//! Scheduled listing ingestion for Italian collectibles marketplaces

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use piranha_ingestion::config::Config;
use piranha_ingestion::http_client::{HttpClientConfig, ResilientHttpClient};
use piranha_ingestion::metrics::start_metrics_server;
use piranha_ingestion::rate_limiter::RateLimiter;
use piranha_ingestion::scheduler::{IntervalTicker, Scheduler, SchedulerSettings};
use piranha_ingestion::schemas::{JobRun, ScrapedRecord, SourceStatus, TickTrigger};
use piranha_ingestion::sources::{build_mock, build_sources, Source};
use piranha_ingestion::storage::{open_store, ListingStore};
use piranha_ingestion::validator;

/// Piranha Ingestion Service - scheduled marketplace listing ingestion
#[derive(Parser, Debug)]
#[command(name = "piranha-ingestion")]
#[command(author = "Piranha Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Scheduled listing ingestion for Italian collectibles marketplaces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the scheduler (first tick runs immediately)
    Run {
        /// Override the tick interval (e.g., "15m", "1h")
        #[arg(short, long)]
        interval: Option<String>,

        /// Seed synthetic listings before the first tick
        #[arg(long, default_value = "false")]
        seed: bool,
    },

    /// Run a single tick and print its summary
    Tick {
        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        output: String,
    },

    /// Populate storage with synthetic listings
    Seed,

    /// Fetch from one source without persisting anything
    Fetch {
        /// Source to fetch from (ebay, tcgdex, mock)
        #[arg(short, long)]
        source: String,

        /// Hub category (tcg, retro, comics)
        #[arg(short, long, conflicts_with = "query")]
        category: Option<String>,

        /// Free-text search query
        #[arg(short, long)]
        query: Option<String>,

        /// Pages for a category fetch, results for a search
        #[arg(short = 'n', long)]
        limit: Option<u32>,

        /// Output format (json, table, summary)
        #[arg(short, long, default_value = "summary")]
        output: String,
    },

    /// Show configured sources and stored listings
    Status,
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Cancels the shutdown token on SIGTERM/SIGINT
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    shutdown.cancel();
}

/// SIGUSR1 requests an immediate tick
#[cfg(unix)]
async fn manual_trigger_signal(scheduler: Arc<Scheduler>, shutdown: CancellationToken) {
    let mut usr1 = match signal::unix::signal(signal::unix::SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Failed to install SIGUSR1 handler, manual ticks unavailable");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = usr1.recv() => {
                if received.is_none() {
                    break;
                }
                info!("Received SIGUSR1, requesting a manual tick");
                scheduler.trigger();
            }
        }
    }
}

#[cfg(not(unix))]
async fn manual_trigger_signal(_scheduler: Arc<Scheduler>, _shutdown: CancellationToken) {}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Piranha Ingestion Service");

    // A bad configuration stops the process before any tick
    let config = Config::load()?;
    config.validate()?;

    info!(
        interval_secs = config.scrape_interval_secs,
        categories = %config.scrape_categories,
        ebay = config.has_ebay(),
        tcgdex = config.tcgdex_enabled,
        database = config.database_url.is_some(),
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    match cli.command {
        Commands::Run { interval, seed } => {
            run_daemon(config, shutdown, interval, seed).await?;
        }

        Commands::Tick { output } => {
            let scheduler = build_scheduler(&config, shutdown).await?;
            let run = scheduler.tick(TickTrigger::Manual).await;
            print_run(&run, &output)?;
        }

        Commands::Seed => {
            let scheduler = build_scheduler(&config, shutdown).await?;
            let run = scheduler.seed().await;
            print_run(&run, "summary")?;
        }

        Commands::Fetch { source, category, query, limit, output } => {
            fetch_once(&config, shutdown, &source, category, query, limit, &output).await?;
        }

        Commands::Status => {
            show_status(&config, shutdown).await?;
        }
    }

    Ok(())
}

fn build_limiter(shutdown: CancellationToken) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(Duration::ZERO, shutdown))
}

/// Wires sources, storage and settings into a scheduler
async fn build_scheduler(config: &Config, shutdown: CancellationToken) -> Result<Scheduler> {
    let limiter = build_limiter(shutdown.clone());
    let http = Arc::new(ResilientHttpClient::new(HttpClientConfig::from_config(config))?);

    let sources = build_sources(config, http, limiter.clone());
    let fallback = build_mock(config, limiter);
    let store = open_store(config).await?;

    Ok(Scheduler::new(
        sources,
        fallback,
        store,
        SchedulerSettings::from_config(config),
        shutdown,
    ))
}

/// Runs the scheduler until shutdown
async fn run_daemon(
    mut config: Config,
    shutdown: CancellationToken,
    interval: Option<String>,
    seed: bool,
) -> Result<()> {
    let period = match interval {
        Some(raw) => humantime::parse_duration(&raw)?,
        None => config.scrape_interval(),
    };
    if period.is_zero() {
        bail!("tick interval must be greater than zero");
    }
    config.seed_on_start |= seed;

    if config.metrics_enabled {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
        let metrics_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics_addr, metrics_shutdown).await {
                error!(error = %e, "Metrics server failed");
            }
        });
        info!(port = config.metrics_port, "Metrics server started at /metrics");
    }

    let scheduler = Arc::new(build_scheduler(&config, shutdown.clone()).await?);
    tokio::spawn(manual_trigger_signal(scheduler.clone(), shutdown));
    info!(
        interval = %humantime::format_duration(period),
        seed_on_start = config.seed_on_start,
        "Piranha Ingestion Service initialized"
    );

    let mut ticker = IntervalTicker::new(period);
    scheduler.run(&mut ticker).await;

    info!("Piranha Ingestion Service stopped");
    Ok(())
}

/// Dry-runs one source and prints what it returned
async fn fetch_once(
    config: &Config,
    shutdown: CancellationToken,
    source_name: &str,
    category: Option<String>,
    query: Option<String>,
    limit: Option<u32>,
    output_format: &str,
) -> Result<()> {
    let limiter = build_limiter(shutdown);
    let http = Arc::new(ResilientHttpClient::new(HttpClientConfig::from_config(config))?);

    let mut sources = build_sources(config, http, limiter.clone());
    sources.push(build_mock(config, limiter));

    let Some(source) = sources.iter().find(|s| s.name() == source_name) else {
        bail!("unknown source: {} (expected ebay, tcgdex or mock)", source_name);
    };
    if !source.is_enabled() {
        let reason = source.descriptor().disabled_reason.clone().unwrap_or_default();
        bail!("source {} is disabled: {}", source_name, reason);
    }

    info!(source = %source_name, category = ?category, query = ?query, limit = ?limit, "Starting fetch");

    let records = match (category, query) {
        (Some(category), None) => {
            source
                .fetch_by_category(&category, limit.unwrap_or(config.scrape_max_pages))
                .await?
        }
        (None, Some(query)) => {
            source
                .fetch_by_search(&query, limit.unwrap_or(config.search_max_results))
                .await?
        }
        _ => bail!("pass exactly one of --category or --query"),
    };

    print_records(source_name, &records, output_format)
}

fn print_records(source: &str, records: &[ScrapedRecord], output_format: &str) -> Result<()> {
    match output_format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(records)?);
        }
        "table" => {
            println!("\n{:<50} {:>10} {:<10} {:<15}", "Title", "Price EUR", "Category", "Region");
            println!("{}", "-".repeat(90));
            for record in records {
                let title: String = record.title.chars().take(48).collect();
                println!(
                    "{:<50} {:>10.2} {:<10} {:<15}",
                    title, record.price_eur, record.category, record.region
                );
            }
            println!("\nTotal: {} listings", records.len());
        }
        _ => {
            let valid = records.iter().filter(|r| validator::validate(r)).count();

            println!("\nFetch Summary");
            println!("=============");
            println!("Source:   {}", source);
            println!("Listings: {}", records.len());
            println!("Valid:    {}", valid);
            println!("Rejected: {}", records.len() - valid);

            if let (Some(cheapest), Some(dearest)) = (
                records.iter().map(|r| r.price_eur).reduce(f64::min),
                records.iter().map(|r| r.price_eur).reduce(f64::max),
            ) {
                println!("Prices:   {:.2} - {:.2} EUR", cheapest, dearest);
            }
        }
    }

    Ok(())
}

fn print_run(run: &JobRun, output_format: &str) -> Result<()> {
    if output_format == "json" {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!("\nTick Summary");
    println!("============");
    println!("Run:        {} ({:?})", run.run_id, run.trigger);
    if let Some(ms) = run.duration_ms() {
        println!("Duration:   {} ms", ms);
    }
    println!("Fallback:   {}", if run.used_fallback { "yes" } else { "no" });
    println!("Fetched:    {}", run.fetched);
    println!("Rejected:   {}", run.rejected);
    println!("Superseded: {}", run.superseded);
    println!("Inserted:   {}", run.inserted);
    println!("Updated:    {}", run.updated);
    println!("Persisted:  {}", run.persisted);
    if let Some(ref e) = run.persist_error {
        println!("Commit:     FAILED ({})", e);
    }

    println!("\nSources:");
    for outcome in &run.outcomes {
        match outcome.status {
            SourceStatus::Succeeded { records } => {
                println!("  - {}: ok, {} listings in {} ms", outcome.source, records, outcome.duration_ms)
            }
            SourceStatus::Failed { ref kind, ref reason } => {
                println!("  - {}: failed [{}] {}", outcome.source, kind, reason)
            }
            SourceStatus::Skipped { ref reason } => println!("  - {}: skipped ({})", outcome.source, reason),
        }
    }

    Ok(())
}

/// Shows configured sources and the stored listing count
async fn show_status(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let limiter = build_limiter(shutdown);
    let http = Arc::new(ResilientHttpClient::new(HttpClientConfig::from_config(config))?);
    let sources = build_sources(config, http, limiter);

    println!("\nPiranha Ingestion Service Status");
    println!("================================\n");

    println!("Configured Sources:");
    for source in &sources {
        let descriptor = source.descriptor();
        match descriptor.disabled_reason {
            Some(ref reason) => println!("  - {:<7} ❌ ({})", descriptor.name, reason),
            None => println!(
                "  - {:<7} ✅ ({}, every {} ms)",
                descriptor.name,
                descriptor.base_url,
                descriptor.rate_limit_interval.as_millis()
            ),
        }
    }

    println!("\nSchedule:");
    println!("  Interval: {}", humantime::format_duration(config.scrape_interval()));
    println!("  Categories: {}", config.category_list().join(", "));
    if !config.search_query_list().is_empty() {
        println!("  Searches: {}", config.search_query_list().join(", "));
    }

    let store = open_store(config).await?;
    println!("\nStorage:");
    println!("  Backend: {}", store.backend());
    println!("  Listings: {}", store.count().await?);

    Ok(())
}
