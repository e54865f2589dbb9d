//! Error types for the breaker core.
//!
//! Admission refusals are modeled as a typed enum so callers can `match` on
//! the kind rather than string-compare, the way an upstream bidder dispatcher
//! would need to when deciding whether to route around a dependency. Internal
//! fallibility (registry/dispatcher plumbing) uses the ordinary `anyhow`
//! convenience re-exports.

pub use anyhow::{anyhow, bail, Context, Error as AnyhowError, Result as AnyhowResult};
pub use thiserror::Error;

/// Common result type using anyhow, for the crate's own internal fallibility.
pub type Result<T> = std::result::Result<T, AnyhowError>;

/// Why an admission attempt was refused.
///
/// Neither variant counts as a dependency failure: rejections never advance
/// `consecutive_failures`, only `total_rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectionError {
    /// The breaker is OPEN and its cooldown has not elapsed, or is HALF_OPEN
    /// with its single probe already outstanding.
    #[error("circuit open")]
    CircuitOpen,
    /// The breaker is CLOSED but `max_concurrent` in-flight requests are
    /// already outstanding.
    #[error("capacity exceeded")]
    CapacityExceeded,
}
