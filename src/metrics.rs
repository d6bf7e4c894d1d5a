//! Prometheus Metrics for the ingestion ticks
//!
//! Metrics include:
//! - records fetched / rejected per source
//! - rows persisted per operation
//! - adapter failures by error kind
//! - tick outcomes and duration
//! - time spent waiting on the per-source rate limiter

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// ============================================
// METRIC DEFINITIONS
// ============================================

pub const TICK_SUCCEEDED: &str = "succeeded";
pub const TICK_PARTIAL: &str = "partial";
pub const TICK_FAILED: &str = "failed";

static RECORDS_FETCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_records_fetched_total",
        "Records returned by each source adapter",
        &["source"]
    ).expect("Failed to create records_fetched metric")
});

static RECORDS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_records_rejected_total",
        "Records dropped by validation",
        &["source"]
    ).expect("Failed to create records_rejected metric")
});

static RECORDS_PERSISTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_records_persisted_total",
        "Rows written to the listing store",
        &["op"]
    ).expect("Failed to create records_persisted metric")
});

static ADAPTER_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_adapter_failures_total",
        "Adapter invocations that contributed no records",
        &["source", "kind"]
    ).expect("Failed to create adapter_failures metric")
});

static ADAPTER_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];
    register_histogram_vec!(
        HistogramOpts::new(
            "ingestion_adapter_duration_seconds",
            "Wall time of one adapter invocation"
        ).buckets(buckets),
        &["source"]
    ).expect("Failed to create adapter_latency metric")
});

static TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ingestion_ticks_total",
        "Scheduler ticks by outcome",
        &["status"]
    ).expect("Failed to create ticks metric")
});

static TICK_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "ingestion_tick_duration_seconds",
        "Wall time of one scheduler tick",
        vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
    ).expect("Failed to create tick_duration metric")
});

static RATE_LIMIT_WAIT: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.0, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];
    register_histogram_vec!(
        HistogramOpts::new(
            "ingestion_rate_limit_wait_seconds",
            "Time callers spent waiting for a source's rate limit slot"
        ).buckets(buckets),
        &["source"]
    ).expect("Failed to create rate_limit_wait metric")
});

static CIRCUIT_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ingestion_circuit_state",
        "Circuit breaker state per source (0 closed, 1 half-open, 2 open, 3 disabled)",
        &["source"]
    ).expect("Failed to create circuit_state metric")
});

// ============================================
// METRICS API
// ============================================

pub fn record_fetched(source: &str, count: u64) {
    RECORDS_FETCHED.with_label_values(&[source]).inc_by(count);
}

pub fn record_rejected(source: &str, count: u64) {
    RECORDS_REJECTED.with_label_values(&[source]).inc_by(count);
}

/// Records rows written by operation (`insert` / `update`)
pub fn record_persisted(op: &str, count: u64) {
    RECORDS_PERSISTED.with_label_values(&[op]).inc_by(count);
}

pub fn record_adapter_failure(source: &str, kind: &str) {
    ADAPTER_FAILURES.with_label_values(&[source, kind]).inc();
}

pub fn record_adapter_latency(source: &str, latency_secs: f64) {
    ADAPTER_LATENCY.with_label_values(&[source]).observe(latency_secs);
}

pub fn record_tick(status: &str, duration_secs: f64) {
    TICKS.with_label_values(&[status]).inc();
    TICK_DURATION.observe(duration_secs);
}

pub fn record_rate_limit_wait(source: &str, wait_secs: f64) {
    RATE_LIMIT_WAIT.with_label_values(&[source]).observe(wait_secs);
}

pub fn set_circuit_state(source: &str, state: i64) {
    CIRCUIT_STATE.with_label_values(&[source]).set(state);
}

// ============================================
// METRICS COLLECTION
// ============================================

/// Collects all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}

// ============================================
// METRICS SERVER
// ============================================

use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use http_body_util::Full;
use hyper::body::Bytes;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;

async fn handle_metrics(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let metrics = gather_metrics();
    Ok(Response::new(Full::new(Bytes::from(metrics))))
}

/// Serves `/metrics` until the shutdown token is cancelled
pub async fn start_metrics_server(addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Metrics server listening");

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Metrics server stopped");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_metrics))
                .await
            {
                error!(error = %e, "Error serving metrics connection");
            }
        });
    }
}
