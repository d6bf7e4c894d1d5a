//! Job scheduler
//!
//! Drives ticks: fan out across enabled sources, validate, upsert the merged
//! batch in one commit, and record a [`JobRun`]. Ticks come from an injected
//! [`Ticker`] (an interval timer in production, a channel in tests) or from a
//! manual trigger, and every wait observes the process shutdown token.
//!
//! State machine: Idle -> Running -> Idle, and Stopped once the loop exits.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::Config;
use crate::dedup::UpsertEngine;
use crate::error::{IngestionError, Result};
use crate::metrics;
use crate::schemas::{JobRun, ScrapedRecord, SourceOutcome, SourceStatus, TickTrigger};
use crate::sources::{fetch_plan, FetchPlan, Source};
use crate::storage::ListingStore;
use crate::validator;

/// Hubs the seed step populates
const SEED_CATEGORIES: &[&str] = &["tcg", "retro", "comics"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// Source of tick events for the scheduler loop
#[async_trait]
pub trait Ticker: Send {
    /// Waits for the next tick. `None` ends the loop.
    async fn next_tick(&mut self) -> Option<TickTrigger>;
}

/// Fixed-period ticker; the first tick fires immediately
pub struct IntervalTicker {
    interval: Interval,
    started: bool,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        // A tick that overruns the period pushes the schedule back instead of bursting
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            started: false,
        }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn next_tick(&mut self) -> Option<TickTrigger> {
        self.interval.tick().await;
        if self.started {
            Some(TickTrigger::Interval)
        } else {
            self.started = true;
            Some(TickTrigger::Startup)
        }
    }
}

/// Ticker driven through a channel; ends when every sender is dropped
pub struct ChannelTicker {
    rx: mpsc::Receiver<TickTrigger>,
}

impl ChannelTicker {
    pub fn new(buffer: usize) -> (mpsc::Sender<TickTrigger>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl Ticker for ChannelTicker {
    async fn next_tick(&mut self) -> Option<TickTrigger> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Deadline for one source's whole fetch plan
    pub adapter_timeout: Duration,
    /// Run the seed step before the first tick
    pub seed_on_start: bool,
    pub plan: FetchPlan,
    pub seed_plan: FetchPlan,
    pub breaker: CircuitBreakerConfig,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            adapter_timeout: config.adapter_timeout(),
            seed_on_start: config.seed_on_start,
            plan: FetchPlan::from_config(config),
            seed_plan: FetchPlan::categories(SEED_CATEGORIES, config.scrape_max_pages),
            breaker: CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_failure_threshold,
                open_duration: Duration::from_secs(config.circuit_breaker_open_duration_secs),
            },
        }
    }
}

/// Result of one source invocation inside a tick
struct Invocation {
    source: String,
    result: Result<Vec<ScrapedRecord>>,
    elapsed: Duration,
}

pub struct Scheduler {
    sources: Vec<Arc<dyn Source>>,
    fallback: Arc<dyn Source>,
    store: Arc<dyn ListingStore>,
    engine: UpsertEngine,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    settings: SchedulerSettings,
    state: RwLock<SchedulerState>,
    seeded: AtomicBool,
    last_run: RwLock<Option<JobRun>>,
    manual: Notify,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        sources: Vec<Arc<dyn Source>>,
        fallback: Arc<dyn Source>,
        store: Arc<dyn ListingStore>,
        settings: SchedulerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let breakers = sources
            .iter()
            .map(|source| {
                let name = source.name().to_string();
                let breaker = Arc::new(CircuitBreaker::new(name.clone(), settings.breaker.clone()));
                (name, breaker)
            })
            .collect();

        Self {
            sources,
            fallback,
            store,
            engine: UpsertEngine::new(),
            breakers,
            settings,
            state: RwLock::new(SchedulerState::Idle),
            seeded: AtomicBool::new(false),
            last_run: RwLock::new(None),
            manual: Notify::new(),
            shutdown,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn last_run(&self) -> Option<JobRun> {
        self.last_run.read().clone()
    }

    pub fn sources(&self) -> &[Arc<dyn Source>] {
        &self.sources
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    pub fn breaker_state(&self, source: &str) -> Option<CircuitState> {
        self.breakers.get(source).map(|b| b.state())
    }

    /// Requests a tick outside the timer; coalesces with a pending request
    pub fn trigger(&self) {
        self.manual.notify_one();
    }

    pub fn has_seeded(&self) -> bool {
        self.seeded.load(Ordering::Acquire)
    }

    /// A source counts as enabled while configured and not auth-disabled
    fn is_live(&self, source: &dyn Source) -> bool {
        source.is_enabled()
            && !self
                .breakers
                .get(source.name())
                .is_some_and(|breaker| breaker.is_disabled())
    }

    /// Runs the loop until the ticker ends or shutdown is requested
    pub async fn run(&self, ticker: &mut dyn Ticker) {
        info!(sources = self.sources.len(), "Scheduler started");

        if self.settings.seed_on_start && !self.has_seeded() {
            self.seed().await;
        }

        loop {
            let trigger = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.manual.notified() => TickTrigger::Manual,
                next = ticker.next_tick() => match next {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            self.tick(trigger).await;
        }

        *self.state.write() = SchedulerState::Stopped;
        info!("Scheduler stopped");
    }

    /// Populates storage from the synthetic source. Marks the scheduler as
    /// seeded once the batch is committed.
    #[instrument(skip(self))]
    pub async fn seed(&self) -> JobRun {
        info!(source = %self.fallback.name(), "Seeding listings");

        let sources = [self.fallback.clone()];
        let run = self
            .execute(TickTrigger::Seed, &sources, &self.settings.seed_plan, Vec::new(), false)
            .await;

        if run.persist_error.is_none() && run.succeeded() > 0 {
            self.seeded.store(true, Ordering::Release);
        }
        run
    }

    /// Runs one tick and returns its summary. Failures are recorded in the
    /// summary; nothing here is fatal.
    #[instrument(skip(self))]
    pub async fn tick(&self, trigger: TickTrigger) -> JobRun {
        let mut skipped = Vec::new();
        let mut runnable: Vec<Arc<dyn Source>> = Vec::new();

        for source in &self.sources {
            let breaker = self.breakers.get(source.name());

            if !source.is_enabled() {
                let reason = source
                    .descriptor()
                    .disabled_reason
                    .clone()
                    .unwrap_or_else(|| "disabled".to_string());
                skipped.push(skipped_outcome(source.name(), reason));
            } else if let Some(reason) = breaker.and_then(|b| b.disabled_reason()) {
                skipped.push(skipped_outcome(source.name(), format!("disabled: {}", reason)));
            } else if breaker.is_some_and(|b| !b.allow_request()) {
                skipped.push(skipped_outcome(source.name(), "circuit open".to_string()));
            } else {
                runnable.push(source.clone());
            }
        }

        let no_live_sources = !self.sources.iter().any(|s| self.is_live(s.as_ref()));
        let use_fallback = no_live_sources && !self.has_seeded();
        if use_fallback {
            info!(source = %self.fallback.name(), "No source enabled, falling back to synthetic listings");
            runnable = vec![self.fallback.clone()];
        }

        self.execute(trigger, &runnable, &self.settings.plan, skipped, use_fallback)
            .await
    }

    async fn execute(
        &self,
        trigger: TickTrigger,
        sources: &[Arc<dyn Source>],
        plan: &FetchPlan,
        skipped: Vec<SourceOutcome>,
        used_fallback: bool,
    ) -> JobRun {
        *self.state.write() = SchedulerState::Running;
        let started = Instant::now();

        let mut run = JobRun::start(trigger);
        run.used_fallback = used_fallback;
        run.outcomes = skipped;

        // Every invocation has finished or been cancelled before anything is merged
        let invocations = join_all(sources.iter().map(|source| self.invoke(source.as_ref(), plan))).await;

        let mut batch = Vec::new();
        for invocation in invocations {
            let duration_ms = invocation.elapsed.as_millis() as u64;
            metrics::record_adapter_latency(&invocation.source, invocation.elapsed.as_secs_f64());

            let status = match invocation.result {
                Ok(records) => {
                    self.record_success(&invocation.source);
                    let fetched = records.len();
                    let (accepted, rejected) = validator::partition(records);

                    metrics::record_fetched(&invocation.source, fetched as u64);
                    metrics::record_rejected(&invocation.source, rejected as u64);
                    run.fetched += fetched;
                    run.rejected += rejected;
                    batch.extend(accepted);

                    SourceStatus::Succeeded { records: fetched }
                }
                Err(e) => {
                    self.record_failure(&invocation.source, &e);
                    SourceStatus::Failed {
                        kind: e.kind().to_string(),
                        reason: e.to_string(),
                    }
                }
            };

            run.outcomes.push(SourceOutcome {
                source: invocation.source,
                status,
                duration_ms,
            });
        }

        match self.engine.upsert(self.store.as_ref(), batch).await {
            Ok(summary) => {
                run.superseded = summary.superseded;
                run.inserted = summary.inserted;
                run.updated = summary.updated;
                run.persisted = summary.persisted;
            }
            Err(e) => {
                error!(error = %e, "Batch commit failed, storage left unchanged for this tick");
                run.persist_error = Some(e.to_string());
            }
        }

        run.finish();
        self.report(&run, started.elapsed());

        *self.last_run.write() = Some(run.clone());
        *self.state.write() = SchedulerState::Idle;
        run
    }

    /// Runs the plan against one source under the adapter deadline
    async fn invoke(&self, source: &dyn Source, plan: &FetchPlan) -> Invocation {
        let started = Instant::now();
        let timeout = self.settings.adapter_timeout;

        let result = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(IngestionError::ShutdownRequested),
            fetched = tokio::time::timeout(timeout, fetch_plan(source, plan)) => match fetched {
                Ok(result) => result,
                Err(_) => Err(IngestionError::Timeout(timeout)),
            },
        };

        Invocation {
            source: source.name().to_string(),
            result,
            elapsed: started.elapsed(),
        }
    }

    fn record_success(&self, source: &str) {
        if let Some(breaker) = self.breakers.get(source) {
            breaker.record_success();
        }
    }

    fn record_failure(&self, source: &str, error: &IngestionError) {
        metrics::record_adapter_failure(source, error.kind());

        let Some(breaker) = self.breakers.get(source) else {
            warn!(source = %source, error = %error, "Source failed");
            return;
        };

        match error {
            e if e.is_auth() => breaker.disable(e.to_string()),
            IngestionError::ShutdownRequested => {}
            e => {
                warn!(source = %source, kind = e.kind(), error = %e, "Source failed, contributing no records");
                breaker.record_failure();
            }
        }
    }

    fn report(&self, run: &JobRun, elapsed: Duration) {
        let status = if run.persist_error.is_some() || (run.attempted() > 0 && run.succeeded() == 0) {
            metrics::TICK_FAILED
        } else if run.failed() > 0 {
            metrics::TICK_PARTIAL
        } else {
            metrics::TICK_SUCCEEDED
        };
        metrics::record_tick(status, elapsed.as_secs_f64());

        info!(
            run_id = %run.run_id,
            trigger = ?run.trigger,
            status,
            attempted = run.attempted(),
            succeeded = run.succeeded(),
            failed = run.failed(),
            fetched = run.fetched,
            rejected = run.rejected,
            superseded = run.superseded,
            inserted = run.inserted,
            updated = run.updated,
            persisted = run.persisted,
            used_fallback = run.used_fallback,
            duration_ms = elapsed.as_millis() as u64,
            "Tick completed"
        );
    }
}

fn skipped_outcome(source: &str, reason: String) -> SourceOutcome {
    SourceOutcome {
        source: source.to_string(),
        status: SourceStatus::Skipped { reason },
        duration_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateLimiter;
    use crate::schemas::{ListingKey, ListingRow, SourceDescriptor};
    use crate::sources::MockSource;
    use crate::storage::{ExistingListing, MemoryListingStore, UpsertOp};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Source that replays scripted results, one per category fetch
    struct ScriptedSource {
        descriptor: SourceDescriptor,
        responses: Mutex<VecDeque<Result<Vec<ScrapedRecord>>>>,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(name: &str, responses: Vec<Result<Vec<ScrapedRecord>>>) -> Arc<Self> {
            Arc::new(Self {
                descriptor: SourceDescriptor::enabled(name, "https://example.test", Duration::ZERO),
                responses: Mutex::new(responses.into()),
                delay: Duration::ZERO,
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                descriptor: SourceDescriptor::enabled(name, "https://example.test", Duration::ZERO),
                responses: Mutex::new(VecDeque::new()),
                delay,
            })
        }

        fn disabled(name: &str) -> Arc<Self> {
            Arc::new(Self {
                descriptor: SourceDescriptor::disabled(name, "https://example.test", Duration::ZERO, "no token"),
                responses: Mutex::new(VecDeque::new()),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Source for ScriptedSource {
        fn descriptor(&self) -> &SourceDescriptor {
            &self.descriptor
        }

        async fn fetch_by_category(&self, _category: &str, _max_pages: u32) -> Result<Vec<ScrapedRecord>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.responses.lock().pop_front();
            next.unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn fetch_by_search(&self, _query: &str, _max_results: u32) -> Result<Vec<ScrapedRecord>> {
            Ok(Vec::new())
        }
    }

    /// Store whose commits can be made to fail
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryListingStore,
        fail_commits: AtomicBool,
    }

    #[async_trait]
    impl ListingStore for FlakyStore {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        async fn lookup(&self, keys: &[ListingKey]) -> Result<HashMap<ListingKey, ExistingListing>> {
            self.inner.lookup(keys).await
        }

        async fn apply(&self, ops: &[UpsertOp]) -> Result<usize> {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(IngestionError::PersistenceError("connection refused".to_string()));
            }
            self.inner.apply(ops).await
        }

        async fn get(&self, key: &ListingKey) -> Result<Option<ListingRow>> {
            self.inner.get(key).await
        }

        async fn count(&self) -> Result<usize> {
            self.inner.count().await
        }
    }

    fn record(source: &str, url: &str, price: f64) -> ScrapedRecord {
        ScrapedRecord::new(source, url, "Carta Pokémon", price, "tcg")
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            adapter_timeout: Duration::from_secs(5),
            seed_on_start: false,
            plan: FetchPlan::categories(&["tcg"], 1),
            seed_plan: FetchPlan::categories(SEED_CATEGORIES, 3),
            breaker: CircuitBreakerConfig::default(),
        }
    }

    fn mock() -> Arc<dyn Source> {
        let limiter = Arc::new(RateLimiter::new(Duration::ZERO, CancellationToken::new()));
        Arc::new(MockSource::new(Duration::ZERO, limiter))
    }

    fn scheduler(sources: Vec<Arc<dyn Source>>, store: Arc<dyn ListingStore>) -> Scheduler {
        Scheduler::new(sources, mock(), store, settings(), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_auth_failure_does_not_block_other_sources() {
        let store = Arc::new(MemoryListingStore::new());
        let ebay = ScriptedSource::new(
            "ebay",
            vec![Err(IngestionError::Authentication("ebay rejected credentials".to_string()))],
        );
        let tcgdex = ScriptedSource::new(
            "tcgdex",
            vec![Ok(vec![record("tcgdex", "https://tcg.test/a", 20.0)])],
        );
        let scheduler = scheduler(vec![ebay, tcgdex], store.clone());

        let run = scheduler.tick(TickTrigger::Manual).await;

        assert_eq!(run.persisted, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(matches!(
            run.outcome("ebay").unwrap().status,
            SourceStatus::Failed { ref kind, .. } if kind == "authentication"
        ));
        assert_eq!(scheduler.breaker_state("ebay"), Some(CircuitState::Disabled));

        // Disabled for the rest of the run
        let next = scheduler.tick(TickTrigger::Interval).await;
        assert!(matches!(next.outcome("ebay").unwrap().status, SourceStatus::Skipped { .. }));
        assert!(!next.used_fallback);
    }

    #[tokio::test]
    async fn test_duplicate_key_in_one_tick_keeps_last() {
        let store = Arc::new(MemoryListingStore::new());
        let ebay = ScriptedSource::new(
            "ebay",
            vec![Ok(vec![
                record("ebay", "https://ebay.test/url1", 100.0),
                record("ebay", "https://ebay.test/url1", 90.0),
            ])],
        );
        let scheduler = scheduler(vec![ebay], store.clone());

        let run = scheduler.tick(TickTrigger::Manual).await;

        assert_eq!(run.superseded, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        let row = store
            .get(&ListingKey::new("ebay", "https://ebay.test/url1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.record.price_eur, 90.0);
    }

    #[tokio::test]
    async fn test_second_tick_updates_price_and_keeps_creation_time() {
        let store = Arc::new(MemoryListingStore::new());
        let tcgdex = ScriptedSource::new(
            "tcgdex",
            vec![
                Ok(vec![record("tcgdex", "https://tcg.test/urlA", 20.0)]),
                Ok(vec![record("tcgdex", "https://tcg.test/urlA", 25.0)]),
            ],
        );
        let scheduler = scheduler(vec![tcgdex], store.clone());
        let key = ListingKey::new("tcgdex", "https://tcg.test/urlA");

        let first = scheduler.tick(TickTrigger::Startup).await;
        assert_eq!(first.inserted, 1);
        let original = store.get(&key).await.unwrap().unwrap();

        let second = scheduler.tick(TickTrigger::Interval).await;
        assert_eq!(second.updated, 1);
        assert_eq!(second.inserted, 0);

        let refreshed = store.get(&key).await.unwrap().unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(refreshed.record.price_eur, 25.0);
        assert_eq!(refreshed.id, original.id);
        assert_eq!(refreshed.created_at, original.created_at);
        assert!(refreshed.scraped_at >= original.scraped_at);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_previous_state() {
        let store = Arc::new(FlakyStore::default());
        let tcgdex = ScriptedSource::new(
            "tcgdex",
            vec![
                Ok(vec![record("tcgdex", "https://tcg.test/urlA", 20.0)]),
                Ok(vec![
                    record("tcgdex", "https://tcg.test/urlA", 25.0),
                    record("tcgdex", "https://tcg.test/urlB", 5.0),
                ]),
                Ok(vec![record("tcgdex", "https://tcg.test/urlA", 30.0)]),
            ],
        );
        let scheduler = scheduler(vec![tcgdex], store.clone());
        let key = ListingKey::new("tcgdex", "https://tcg.test/urlA");

        scheduler.tick(TickTrigger::Startup).await;

        store.fail_commits.store(true, Ordering::SeqCst);
        let failed = scheduler.tick(TickTrigger::Interval).await;
        assert!(failed.persist_error.is_some());
        assert_eq!(failed.persisted, 0);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(&key).await.unwrap().unwrap().record.price_eur, 20.0);

        store.fail_commits.store(false, Ordering::SeqCst);
        let recovered = scheduler.tick(TickTrigger::Interval).await;
        assert!(recovered.persist_error.is_none());
        assert_eq!(store.get(&key).await.unwrap().unwrap().record.price_eur, 30.0);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_fallback_when_nothing_is_enabled() {
        let store = Arc::new(MemoryListingStore::new());
        let scheduler = scheduler(vec![ScriptedSource::disabled("ebay")], store.clone());

        let run = scheduler.tick(TickTrigger::Startup).await;

        assert!(run.used_fallback);
        assert!(run.outcome("mock").unwrap().is_success());
        assert!(matches!(run.outcome("ebay").unwrap().status, SourceStatus::Skipped { .. }));
        assert!(store.count().await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_no_fallback_after_seed() {
        let store = Arc::new(MemoryListingStore::new());
        let scheduler = scheduler(vec![ScriptedSource::disabled("ebay")], store.clone());

        let seed = scheduler.seed().await;
        assert_eq!(seed.trigger, TickTrigger::Seed);
        assert!(scheduler.has_seeded());
        let seeded_rows = store.count().await.unwrap();
        assert_eq!(seeded_rows, 13);

        let run = scheduler.tick(TickTrigger::Interval).await;
        assert!(!run.used_fallback);
        assert_eq!(run.persisted, 0);
        assert_eq!(store.count().await.unwrap(), seeded_rows);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out_alone() {
        let store = Arc::new(MemoryListingStore::new());
        let slow = ScriptedSource::slow("ebay", Duration::from_secs(60));
        let fast = ScriptedSource::new(
            "tcgdex",
            vec![Ok(vec![record("tcgdex", "https://tcg.test/a", 20.0)])],
        );
        let scheduler = scheduler(vec![slow, fast], store.clone());

        let run = scheduler.tick(TickTrigger::Manual).await;

        assert!(matches!(
            run.outcome("ebay").unwrap().status,
            SourceStatus::Failed { ref kind, .. } if kind == "timeout"
        ));
        assert!(run.outcome("tcgdex").unwrap().is_success());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_follows_ticker() {
        let store = Arc::new(MemoryListingStore::new());
        let tcgdex = ScriptedSource::new(
            "tcgdex",
            vec![
                Ok(vec![record("tcgdex", "https://tcg.test/a", 20.0)]),
                Ok(vec![record("tcgdex", "https://tcg.test/b", 21.0)]),
            ],
        );
        let scheduler = scheduler(vec![tcgdex], store.clone());
        let (tx, mut ticker) = ChannelTicker::new(4);

        tx.send(TickTrigger::Startup).await.unwrap();
        tx.send(TickTrigger::Interval).await.unwrap();
        drop(tx);

        scheduler.run(&mut ticker).await;

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.last_run().unwrap().trigger, TickTrigger::Interval);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(
            vec![ScriptedSource::new("tcgdex", vec![])],
            mock(),
            Arc::new(MemoryListingStore::new()),
            settings(),
            shutdown.clone(),
        ));

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let mut ticker = IntervalTicker::new(Duration::from_secs(1800));
                scheduler.run(&mut ticker).await;
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.last_run().unwrap().trigger, TickTrigger::Startup);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_runs_between_interval_ticks() {
        let store = Arc::new(MemoryListingStore::new());
        let tcgdex = ScriptedSource::new(
            "tcgdex",
            vec![
                Ok(vec![record("tcgdex", "https://tcg.test/a", 20.0)]),
                Ok(vec![record("tcgdex", "https://tcg.test/b", 21.0)]),
            ],
        );
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(
            vec![tcgdex],
            mock(),
            store.clone(),
            settings(),
            shutdown.clone(),
        ));

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let mut ticker = IntervalTicker::new(Duration::from_secs(1800));
                scheduler.run(&mut ticker).await;
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.last_run().unwrap().trigger, TickTrigger::Startup);

        scheduler.trigger();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let manual = scheduler.last_run().unwrap();
        assert_eq!(manual.trigger, TickTrigger::Manual);
        assert_eq!(manual.inserted, 1);
        assert_eq!(store.count().await.unwrap(), 2);

        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_mid_tick_commits_finished_sources() {
        let store = Arc::new(MemoryListingStore::new());
        let slow = ScriptedSource::slow("ebay", Duration::from_secs(3));
        let fast = ScriptedSource::new(
            "tcgdex",
            vec![Ok(vec![record("tcgdex", "https://tcg.test/a", 20.0)])],
        );
        let shutdown = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(
            vec![slow, fast],
            mock(),
            store.clone(),
            settings(),
            shutdown.clone(),
        ));

        let tick = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.tick(TickTrigger::Interval).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        let run = tick.await.unwrap();

        assert!(matches!(
            run.outcome("ebay").unwrap().status,
            SourceStatus::Failed { ref kind, .. } if kind == "cancelled"
        ));
        assert!(run.outcome("tcgdex").unwrap().is_success());
        assert!(run.persist_error.is_none());
        assert_eq!(store.count().await.unwrap(), 1);
        // Cancellation is not a source fault
        assert_eq!(scheduler.breaker_state("ebay"), Some(CircuitState::Closed));
    }
}
