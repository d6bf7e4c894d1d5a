//! Per-source request spacing
//!
//! Every source gets its own `governor` limiter with a burst of one, so the
//! first request goes through at once and later ones are granted at least
//! `interval` apart, however many callers share the source. Sources with a
//! zero interval are not limited. Limiters run on tokio's clock and sleep
//! on tokio timers, so waits observe the shutdown token and paused test time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{IngestionError, Result};
use crate::metrics;

/// Clock reading tokio time as the offset from the limiter's creation
#[derive(Debug, Clone, Copy)]
struct TokioClock {
    origin: Instant,
}

impl Clock for TokioClock {
    type Instant = Duration;

    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

type SourceLimiter = governor::RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<Duration>>;

pub struct RateLimiter {
    default_interval: Duration,
    intervals: RwLock<HashMap<String, Duration>>,
    /// `None` marks a source without spacing
    limiters: Mutex<HashMap<String, Option<Arc<SourceLimiter>>>>,
    clock: TokioClock,
    shutdown: CancellationToken,
}

impl RateLimiter {
    pub fn new(default_interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            default_interval,
            intervals: RwLock::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
            clock: TokioClock { origin: Instant::now() },
            shutdown,
        }
    }

    /// Overrides the spacing for one source
    pub fn set_interval(&self, source: &str, interval: Duration) {
        self.intervals.write().insert(source.to_string(), interval);
        self.limiters.lock().remove(source);
    }

    pub fn interval_for(&self, source: &str) -> Duration {
        self.intervals
            .read()
            .get(source)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Token observed by every wait; cancelling it releases all waiters
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    fn limiter(&self, source: &str) -> Option<Arc<SourceLimiter>> {
        let interval = self.interval_for(source);
        self.limiters
            .lock()
            .entry(source.to_string())
            .or_insert_with(|| {
                Quota::with_period(interval)
                    .map(|quota| Arc::new(governor::RateLimiter::direct_with_clock(quota, self.clock)))
            })
            .clone()
    }

    /// Blocks until the source's limiter grants a request. The first call
    /// for a source returns at once.
    pub async fn wait(&self, source: &str) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(IngestionError::ShutdownRequested);
        }

        let requested_at = Instant::now();
        if let Some(limiter) = self.limiter(source) {
            while let Err(not_until) = limiter.check() {
                let delay = not_until.wait_time_from(self.clock.now());
                trace!(source = %source, wait_ms = delay.as_millis() as u64, "Rate limited");
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return Err(IngestionError::ShutdownRequested),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        metrics::record_rate_limit_wait(source, requested_at.elapsed().as_secs_f64());
        Ok(())
    }
}
