//! Piranha Ingestion Service
//! Scheduled listing ingestion for Italian collectibles marketplaces
//!
//! Features:
//! - Multiple listing sources (eBay Browse API, TCGdex, synthetic catalogue)
//! - Per-source request spacing plus a global request ceiling
//! - Exponential backoff with jitter for transient failures
//! - Circuit breaker per source; sources rejecting credentials are disabled
//! - Record validation before persistence
//! - Deduplication on (source, canonical URL) with all-or-nothing batch upserts
//! - PostgreSQL or in-memory storage
//! - Graceful shutdown with SIGTERM handling
//! - Prometheus metrics per source and per tick

pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod rate_limiter;
pub mod scheduler;
pub mod schemas;
pub mod sources;
pub mod storage;
pub mod validator;

pub use config::Config;
pub use error::{IngestionError, Result};
pub use scheduler::{Scheduler, SchedulerSettings};
