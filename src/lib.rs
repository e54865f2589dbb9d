//! Dependency-failure isolation core for a real-time bidding server.
//!
//! Protects calls to unreliable collaborators — bidders, the
//! identity-resolution service — behind a consecutive-count circuit
//! breaker, a keyed registry that creates breakers lazily per dependency,
//! and a state-change dispatcher that keeps user observer callbacks off the
//! hot path. Everything else a bidding server needs — HTTP endpoints,
//! metrics exposition, account lookup, auction logic — is an external
//! collaborator; this crate only defines the narrow contracts in
//! [`metrics`] by which those collaborators plug in.
//!
//! - **[`breaker`]**: the `CircuitBreaker` state machine.
//! - **[`registry`]**: `BreakerRegistry`, a keyed collection of breakers.
//! - **[`dispatcher`]**: the state-change dispatcher, used internally by
//!   every breaker; rarely constructed directly.
//! - **[`metrics`]**: the `MetricsSink` trait implemented by the
//!   surrounding system.
//! - **[`guard`]**: adapters splicing a breaker into a call site.
//! - **[`error`]**: the typed rejection error and `anyhow` convenience
//!   re-exports.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rtb_breaker::{BreakerRegistry, Config, Outcome, execute};
//!
//! # async fn call_bidder() -> anyhow::Result<String> { Ok("bid".into()) }
//! # async fn run() -> anyhow::Result<()> {
//! let registry = BreakerRegistry::new(Config::default());
//! let breaker = registry.get("acme-bidder").await;
//!
//! let result = execute(&breaker, call_bidder).await;
//! match result {
//!     Ok(bid) => println!("got {bid}"),
//!     Err(_) => println!("bidder unavailable, skipping"),
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod breaker;
pub mod dispatcher;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod registry;

pub use breaker::{CircuitBreaker, Clock, Config, Outcome, State, Stats, SystemClock};
pub use dispatcher::StateChangeCallback;
pub use error::RejectionError;
pub use guard::{execute, guard_async, GuardError, Permit};
pub use metrics::{MetricsSink, NoopMetricsSink};
pub use registry::BreakerRegistry;
