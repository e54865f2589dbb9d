//! State-Change Dispatcher.
//!
//! Isolates a breaker's user-supplied `on_state_change` observer from the
//! hot path. A transition enqueues a `(from, to)` event onto an unbounded
//! channel; a single worker task per breaker drains that channel strictly
//! sequentially, which is what gives per-breaker event ordering without an
//! explicit sequence number. Each delivery runs on its own spawned task so a
//! panicking observer surfaces as a `JoinError` rather than unwinding into
//! the worker, and is bounded by [`DELIVERY_DEADLINE`] via `tokio::time::timeout`
//! — the same timeout-wrapped-spawn shape used for handler dispatch in this
//! codebase's event bus.
//!
//! Dropping a timed-out `JoinHandle` does not abort the task it was tracking;
//! a truly blocking observer leaks a background task forever. The dispatcher
//! only guarantees that the worker's wait on that task gives up at the
//! deadline and that [`Dispatcher::close`] itself still returns promptly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::breaker::State;

/// Per-callback delivery deadline for state-change notifications.
pub const DELIVERY_DEADLINE: Duration = Duration::from_secs(5);

/// A user-supplied observer invoked once per distinct state transition.
///
/// Arguments are the stable state-name strings (`"closed"`, `"open"`,
/// `"half-open"`) for the state being left and the state being entered.
pub type StateChangeCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Owns one breaker's transition queue and delivery worker.
pub struct Dispatcher {
    tx: Mutex<Option<mpsc::UnboundedSender<(State, State)>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    outstanding: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Spawns the worker task. Must be called from within a tokio runtime.
    pub fn new(observer: Option<StateChangeCallback>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(Self::run(rx, observer, outstanding.clone()));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            outstanding,
        }
    }

    /// Enqueues a transition. Never blocks and never fails loudly: after
    /// `close()`, or if the worker task has already exited, the event is
    /// silently dropped — per-breaker behavior past `close()` is undefined.
    pub fn notify(&self, from: State, to: State) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send((from, to));
        }
    }

    /// Number of deliveries currently in flight (0 or 1, since the worker
    /// processes its queue sequentially).
    pub fn outstanding_deliveries(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Closes the transition queue and waits for the worker to drain it,
    /// bounded by [`DELIVERY_DEADLINE`] per queued event.
    pub async fn close(&self) {
        let sender = self.tx.lock().unwrap().take();
        drop(sender);
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(
        mut rx: mpsc::UnboundedReceiver<(State, State)>,
        observer: Option<StateChangeCallback>,
        outstanding: Arc<AtomicUsize>,
    ) {
        while let Some((from, to)) = rx.recv().await {
            let Some(cb) = observer.clone() else {
                continue;
            };
            let from_s = from.as_str();
            let to_s = to.as_str();
            outstanding.fetch_add(1, Ordering::SeqCst);
            let handle = tokio::spawn(async move {
                cb(from_s, to_s);
            });
            match tokio::time::timeout(DELIVERY_DEADLINE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!(
                        from = from_s,
                        to = to_s,
                        error = %join_err,
                        "state-change observer panicked"
                    );
                }
                Err(_) => {
                    warn!(
                        from = from_s,
                        to = to_s,
                        "state-change observer exceeded delivery deadline; abandoning"
                    );
                }
            }
            outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn delivers_transition_in_order() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let notify = Arc::new(Notify::new());
        let notify_clone = notify.clone();

        let observer: StateChangeCallback = Arc::new(move |from, to| {
            seen_clone
                .lock()
                .unwrap()
                .push((from.to_string(), to.to_string()));
            if seen_clone.lock().unwrap().len() == 3 {
                notify_clone.notify_one();
            }
        });

        let dispatcher = Dispatcher::new(Some(observer));
        dispatcher.notify(State::Closed, State::Open);
        dispatcher.notify(State::Open, State::HalfOpen);
        dispatcher.notify(State::HalfOpen, State::Closed);

        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .expect("observer should have run");

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("closed".to_string(), "open".to_string()),
                ("open".to_string(), "half-open".to_string()),
                ("half-open".to_string(), "closed".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn panicking_observer_is_contained() {
        let ran_after: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let ran_after_clone = ran_after.clone();
        let observer: StateChangeCallback = Arc::new(move |_from, to| {
            if to == "open" {
                panic!("boom");
            }
            ran_after_clone.store(true, Ordering::SeqCst);
        });

        let dispatcher = Dispatcher::new(Some(observer));
        dispatcher.notify(State::Closed, State::Open);
        dispatcher.notify(State::Open, State::HalfOpen);
        dispatcher.close().await;

        assert!(ran_after.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_observer_does_not_stall_close() {
        let observer: StateChangeCallback = Arc::new(|_from, _to| {
            std::thread::sleep(Duration::from_secs(3600));
        });

        let dispatcher = Dispatcher::new(Some(observer));
        dispatcher.notify(State::Closed, State::Open);

        let start = Instant::now();
        dispatcher.close().await;
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn close_with_no_observer_returns_immediately() {
        let dispatcher = Dispatcher::new(None);
        dispatcher.notify(State::Closed, State::Open);
        let start = Instant::now();
        dispatcher.close().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
