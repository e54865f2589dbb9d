//! The metrics sink interface consumed by the breaker.
//!
//! The breaker only calls these methods; it never queries them. Every method
//! is invoked while the breaker holds no internal lock, so implementations
//! are free to do their own locking or channel sends without risking
//! deadlock against the breaker's state machine. Implementations must be
//! cheap and non-blocking — a sink that contends heavily or blocks will sit
//! directly on the hot path of every request.

use std::fmt;

/// Receives request, outcome, rejection, and transition signals from one or
/// more breakers, keyed by the dependency name each breaker was registered
/// under.
pub trait MetricsSink: Send + Sync {
    /// Called once per admission attempt, admitted or rejected.
    fn on_request(&self, key: &str);

    /// Called once per successful completion (`after_request(Outcome::Success)`
    /// or `record_success()`).
    fn on_success(&self, key: &str);

    /// Called once per failed completion.
    fn on_failure(&self, key: &str);

    /// Called once per rejected admission attempt, in addition to `on_request`.
    fn on_rejected(&self, key: &str);

    /// Called once per state transition, with the stable state-name strings
    /// from `State::as_str`.
    fn on_state_change(&self, key: &str, from: &str, to: &str);

    /// Called on every transition with the new state as a gauge value:
    /// 0 = closed, 1 = open, 2 = half-open.
    fn set_state(&self, key: &str, state: u8);
}

impl fmt::Debug for dyn MetricsSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn MetricsSink")
    }
}

/// A sink that discards every signal. The default for breakers and
/// registries constructed without an explicit metrics backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn on_request(&self, _key: &str) {}
    fn on_success(&self, _key: &str) {}
    fn on_failure(&self, _key: &str) {}
    fn on_rejected(&self, _key: &str) {}
    fn on_state_change(&self, _key: &str, _from: &str, _to: &str) {}
    fn set_state(&self, _key: &str, _state: u8) {}
}
