//! Circuit Breaker Pattern
//!
//! Skips a source for whole ticks after it keeps failing, so a broken
//! marketplace does not burn the adapter timeout every interval.
//! States: Closed (normal) -> Open (failing) -> HalfOpen (one trial tick)
//!
//! Authentication failures bypass the counters and move the breaker to
//! `Disabled`, which only a process restart (with new credentials) clears.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::metrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - the source runs every tick
    Closed,
    /// Failing - the source is skipped until the open duration elapses
    Open,
    /// Probing - one tick is allowed through to test recovery
    HalfOpen,
    /// Credentials rejected - skipped for the rest of the process run
    Disabled,
}

impl CircuitState {
    fn gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
            CircuitState::Disabled => 3,
        }
    }
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failed ticks before opening
    pub failure_threshold: u32,
    /// Duration to keep circuit open before probing
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(300),
        }
    }
}

/// Circuit breaker for a single source
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    disabled_reason: RwLock<Option<String>>,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            disabled_reason: RwLock::new(None),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    pub fn is_disabled(&self) -> bool {
        self.state() == CircuitState::Disabled
    }

    pub fn disabled_reason(&self) -> Option<String> {
        self.disabled_reason.read().clone()
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            trips: self.trips.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: &mut CircuitState, next: CircuitState) {
        *state = next;
        metrics::set_circuit_state(&self.name, next.gauge());
    }

    /// Checks whether the source may run this tick
    pub fn allow_request(&self) -> bool {
        let mut state = self.state.write();

        match *state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Disabled => false,
            CircuitState::Open => {
                let cooled_down = self
                    .opened_at
                    .read()
                    .map_or(true, |opened| opened.elapsed() >= self.config.open_duration);

                if cooled_down {
                    info!(circuit = %self.name, "Circuit transitioning from Open to HalfOpen");
                    self.set_state(&mut state, CircuitState::HalfOpen);
                    true
                } else {
                    debug!(circuit = %self.name, "Circuit is Open - source skipped");
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write();
        match *state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                info!(circuit = %self.name, "Circuit recovered - transitioning to Closed");
                self.failure_count.store(0, Ordering::Relaxed);
                self.set_state(&mut state, CircuitState::Closed);
            }
            CircuitState::Disabled => {}
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.write();
        match *state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;

                if failures >= self.config.failure_threshold {
                    warn!(
                        circuit = %self.name,
                        failures = failures,
                        threshold = self.config.failure_threshold,
                        open_duration_secs = self.config.open_duration.as_secs(),
                        "Circuit tripped - transitioning to Open"
                    );
                    *self.opened_at.write() = Some(Instant::now());
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    self.set_state(&mut state, CircuitState::Open);
                } else {
                    debug!(
                        circuit = %self.name,
                        failures = failures,
                        threshold = self.config.failure_threshold,
                        "Failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(circuit = %self.name, "Trial tick failed - transitioning back to Open");
                *self.opened_at.write() = Some(Instant::now());
                self.trips.fetch_add(1, Ordering::Relaxed);
                self.set_state(&mut state, CircuitState::Open);
            }
            CircuitState::Open | CircuitState::Disabled => {}
        }
    }

    /// Moves the breaker to the terminal `Disabled` state. Logged only on
    /// the first call.
    pub fn disable(&self, reason: impl Into<String>) {
        let mut state = self.state.write();
        if *state == CircuitState::Disabled {
            return;
        }

        let reason = reason.into();
        error!(
            circuit = %self.name,
            reason = %reason,
            "Source disabled for the rest of this run"
        );
        *self.disabled_reason.write() = Some(reason);
        self.set_state(&mut state, CircuitState::Disabled);
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub trips: u64,
}
