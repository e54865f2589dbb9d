//! The circuit breaker state machine.
//!
//! Guards calls to one dependency (a bidder, the identity-resolution
//! service) behind three states — CLOSED, OPEN, HALF_OPEN — driven by
//! consecutive failure/success counts rather than a sliding window: a single
//! intervening success in CLOSED resets the failure streak, and the breaker
//! never inspects a failure rate. OPEN→HALF_OPEN is checked only on
//! admission attempts; there is no background timer.
//!
//! All mutating operations serialize through one `std::sync::Mutex<Inner>`.
//! Nothing ever awaits while holding it: the observer hand-off to the
//! [`crate::dispatcher::Dispatcher`] happens strictly after the guard is
//! dropped, following the same phase-based locking discipline this
//! codebase's extraction-result recorder uses (compute the outcome under the
//! lock, emit to observers only once it is released).

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dispatcher::{Dispatcher, StateChangeCallback};
use crate::error::RejectionError;
use crate::metrics::{MetricsSink, NoopMetricsSink};

/// Abstracts wall-clock time so tests can advance it deterministically
/// instead of sleeping past real `open_timeout`s.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The default [`Clock`], backed by [`SystemTime::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => u64::try_from(d.as_millis()).unwrap_or(u64::MAX),
            Err(_) => {
                tracing::error!("system clock is before the Unix epoch");
                0
            }
        }
    }
}

/// One of the three states a breaker can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Normal operation. Admission is gated only by `max_concurrent`.
    Closed,
    /// Fast-failing. All admissions rejected until the cooldown elapses.
    Open,
    /// Probing recovery. At most one admission outstanding.
    HalfOpen,
}

impl State {
    /// The stable state-name string used by the observer callback and by
    /// `on_state_change`: `"closed"`, `"open"`, or `"half-open"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }

    /// The gauge encoding used by `MetricsSink::set_state`: 0/1/2.
    pub fn as_gauge(&self) -> u8 {
        match self {
            State::Closed => 0,
            State::Open => 1,
            State::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker configuration. Immutable once a breaker is constructed.
#[derive(Clone)]
pub struct Config {
    /// Consecutive failures in CLOSED that trip the breaker to OPEN.
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN that close the breaker.
    pub success_threshold: u32,
    /// Time the breaker stays OPEN before admitting a recovery probe.
    pub open_timeout_ms: u64,
    /// Cap on in-flight permits while CLOSED. 0 means unlimited.
    pub max_concurrent: u32,
    /// Invoked once per distinct transition, off the hot path.
    pub on_state_change: Option<StateChangeCallback>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_timeout_ms", &self.open_timeout_ms)
            .field("max_concurrent", &self.max_concurrent)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
            max_concurrent: 0,
            on_state_change: None,
        }
    }
}

/// A point-in-time snapshot of a breaker's counters. Field names are part of
/// the contract wherever a surrounding system (an admin/status endpoint)
/// serializes this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Current state.
    pub state: State,
    /// Lifetime count of admission attempts, admitted or rejected.
    pub total_requests: u64,
    /// Lifetime count of completions recorded as failures.
    pub total_failures: u64,
    /// Lifetime count of completions recorded as successes.
    pub total_successes: u64,
    /// Lifetime count of rejected admission attempts.
    pub total_rejected: u64,
    /// Current consecutive-failure streak.
    pub consecutive_failures: u32,
    /// Requests currently admitted and not yet completed.
    pub in_flight: u32,
}

/// The outcome of a completed call, as judged by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The dependency call succeeded.
    Success,
    /// The dependency call failed.
    Failure,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at_ms: u64,
    in_flight: u32,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    total_rejected: u64,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at_ms: 0,
            in_flight: 0,
            total_requests: 0,
            total_failures: 0,
            total_successes: 0,
            total_rejected: 0,
        }
    }
}

type Transition = Option<(State, State)>;

/// Guards one logical dependency. Constructed directly for standalone use,
/// or handed out by a [`crate::registry::BreakerRegistry`] keyed by
/// dependency name.
pub struct CircuitBreaker {
    key: String,
    cfg: Config,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    dispatcher: Dispatcher,
    metrics: Arc<dyn MetricsSink>,
}

impl CircuitBreaker {
    /// Constructs a breaker using the real system clock and a no-op metrics
    /// sink. Must be called from within a tokio runtime, since the
    /// state-change dispatcher spawns its worker task on construction.
    pub fn new(key: impl Into<String>, cfg: Config) -> Arc<Self> {
        Self::with_clock_and_metrics(key, cfg, Arc::new(SystemClock), Arc::new(NoopMetricsSink))
    }

    /// As [`CircuitBreaker::new`], with an explicit metrics sink.
    pub fn with_metrics(
        key: impl Into<String>,
        cfg: Config,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Self::with_clock_and_metrics(key, cfg, Arc::new(SystemClock), metrics)
    }

    /// Fully explicit constructor, used by the registry and by tests that
    /// need a deterministic [`Clock`].
    pub fn with_clock_and_metrics(
        key: impl Into<String>,
        cfg: Config,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let observer = cfg.on_state_change.clone();
        Arc::new(Self {
            key: key.into(),
            cfg,
            clock,
            inner: Mutex::new(Inner::default()),
            dispatcher: Dispatcher::new(observer),
            metrics,
        })
    }

    /// The dependency key this breaker was constructed with.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// A self-consistent snapshot of this breaker's counters.
    pub fn stats(&self) -> Stats {
        let inner = self.inner.lock().unwrap();
        Stats {
            state: inner.state,
            total_requests: inner.total_requests,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            total_rejected: inner.total_rejected,
            consecutive_failures: inner.consecutive_failures,
            in_flight: inner.in_flight,
        }
    }

    /// Decides whether a request may proceed. On success the caller must
    /// eventually call exactly one of [`CircuitBreaker::after_request`] (with
    /// the matching [`Outcome`]) — see [`crate::guard`] for adapters that
    /// guarantee this.
    pub fn before_request(&self) -> Result<(), RejectionError> {
        let (result, transition) = {
            let mut inner = self.inner.lock().unwrap();
            inner.total_requests += 1;
            match inner.state {
                State::Closed => {
                    if self.cfg.max_concurrent > 0 && inner.in_flight >= self.cfg.max_concurrent {
                        inner.total_rejected += 1;
                        (Err(RejectionError::CapacityExceeded), None)
                    } else {
                        inner.in_flight += 1;
                        (Ok(()), None)
                    }
                }
                State::Open => {
                    let now = self.clock.now_ms();
                    if now.saturating_sub(inner.last_failure_at_ms) > self.cfg.open_timeout_ms {
                        let transition = self.transition_locked(&mut inner, State::HalfOpen);
                        inner.in_flight += 1;
                        (Ok(()), transition)
                    } else {
                        inner.total_rejected += 1;
                        (Err(RejectionError::CircuitOpen), None)
                    }
                }
                State::HalfOpen => {
                    if inner.in_flight == 0 {
                        inner.in_flight += 1;
                        (Ok(()), None)
                    } else {
                        inner.total_rejected += 1;
                        (Err(RejectionError::CircuitOpen), None)
                    }
                }
            }
        };

        self.metrics.on_request(&self.key);
        if result.is_err() {
            self.metrics.on_rejected(&self.key);
        }
        self.emit(transition);
        result
    }

    /// Records the outcome of a request previously admitted by
    /// [`CircuitBreaker::before_request`], releasing its `in_flight` permit.
    pub fn after_request(&self, outcome: Outcome) {
        let transition = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight = inner.in_flight.saturating_sub(1);
            match outcome {
                Outcome::Failure => self.record_failure_locked(&mut inner),
                Outcome::Success => self.record_success_locked(&mut inner),
            }
        };
        self.finish(outcome, transition);
    }

    /// Records a failure out of band, without an accompanying
    /// `before_request`/`after_request` pair. Does not touch `in_flight`.
    /// Mixing this with `after_request` for the same logical request will
    /// mis-account `in_flight` — pick one discipline per call site.
    pub fn record_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock().unwrap();
            self.record_failure_locked(&mut inner)
        };
        self.finish(Outcome::Failure, transition);
    }

    /// Records a success out of band. See [`CircuitBreaker::record_failure`].
    pub fn record_success(&self) {
        let transition = {
            let mut inner = self.inner.lock().unwrap();
            self.record_success_locked(&mut inner)
        };
        self.finish(Outcome::Success, transition);
    }

    /// Forces the breaker to CLOSED and zeroes both consecutive counters.
    /// Lifetime counters are untouched.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock().unwrap();
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            self.transition_locked(&mut inner, State::Closed)
        };
        self.emit(transition);
    }

    /// Forces the breaker to OPEN, as if a failure had just occurred.
    pub fn force_open(&self) {
        let transition = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_failure_at_ms = self.clock.now_ms();
            self.transition_locked(&mut inner, State::Open)
        };
        self.emit(transition);
    }

    /// Waits for this breaker's outstanding state-change deliveries to
    /// drain, bounded by the dispatcher's per-event deadline. After this
    /// returns, further admissions and completions are undefined.
    pub async fn close(&self) {
        self.dispatcher.close().await;
    }

    fn record_failure_locked(&self, inner: &mut Inner) -> Transition {
        inner.total_failures += 1;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure_at_ms = self.clock.now_ms();
        match inner.state {
            State::Closed => {
                if inner.consecutive_failures >= self.cfg.failure_threshold {
                    self.transition_locked(inner, State::Open)
                } else {
                    None
                }
            }
            State::HalfOpen => self.transition_locked(inner, State::Open),
            State::Open => None,
        }
    }

    fn record_success_locked(&self, inner: &mut Inner) -> Transition {
        inner.total_successes += 1;
        inner.consecutive_successes += 1;
        match inner.state {
            State::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            State::HalfOpen => {
                if inner.consecutive_successes >= self.cfg.success_threshold {
                    self.transition_locked(inner, State::Closed)
                } else {
                    None
                }
            }
            State::Open => None,
        }
    }

    /// Applies a state change, if any, while the lock is held. Never emits
    /// to observers here — that happens strictly after release, via
    /// `emit`/`finish`.
    fn transition_locked(&self, inner: &mut Inner, to: State) -> Transition {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        inner.consecutive_successes = 0;
        if to == State::Closed {
            inner.consecutive_failures = 0;
        }
        Some((from, to))
    }

    fn finish(&self, outcome: Outcome, transition: Transition) {
        match outcome {
            Outcome::Success => self.metrics.on_success(&self.key),
            Outcome::Failure => self.metrics.on_failure(&self.key),
        }
        self.emit(transition);
    }

    fn emit(&self, transition: Transition) {
        if let Some((from, to)) = transition {
            self.metrics.on_state_change(&self.key, from.as_str(), to.as_str());
            self.metrics.set_state(&self.key, to.as_gauge());
            self.dispatcher.notify(from, to);
            info!(key = %self.key, from = from.as_str(), to = to.as_str(), "circuit breaker transition");
        }
    }
}
