//! Error types for the rate limiter.
//!
//! Three layers, kept deliberately distinct so callers can tell them apart:
//!
//! - [`ConfigError`] — invalid policy configuration, raised at load time and
//!   never at request time. Fatal: the process should refuse to start.
//! - [`StoreError`] — the active backend could not complete an atomic
//!   update. Retryable at a higher layer; never conflated with a quota
//!   rejection.
//! - [`RateLimitError`] — what [`crate::engine::RateLimiter::consume`]
//!   returns. Wraps backend failures and adds deadline expiry and the
//!   can-never-succeed cost case.
//!
//! An over-quota outcome is *not* an error: it is
//! [`crate::engine::Decision::Rejected`].

use crate::bandwidth::BandwidthError;
use std::time::Duration;

/// Invalid policy configuration, detected at load time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A bandwidth in a policy failed validation.
    #[error("policy `{policy}`: {source}")]
    InvalidBandwidth {
        /// Name of the offending policy (or the default entry).
        policy: String,
        #[source]
        source: BandwidthError,
    },
    /// Burst settings were partially specified.
    #[error(
        "policy `{policy}`: burst capacity, refill amount, and period must be given together"
    )]
    IncompleteBurst { policy: String },
    /// Two policies share a name.
    #[error("duplicate policy name `{name}`")]
    DuplicatePolicy { name: String },
}

/// Failure of the active storage backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The storage medium is unreachable or returned an unexpected failure.
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },
    /// The relational adapter gave up waiting for the row lock.
    #[error("timed out waiting for the lock on `{key}`")]
    LockTimeout { key: String },
    /// The clustered adapter lost every optimistic-update attempt.
    #[error("optimistic update lost {attempts} consecutive races")]
    ContentionExhausted { attempts: u32 },
    /// Stored bucket state could not be decoded.
    #[error("stored bucket state is corrupt: {message}")]
    Corrupt { message: String },
}

impl StoreError {
    /// Wrap any transport-level failure as `Unavailable`.
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        StoreError::Unavailable { message: err.to_string() }
    }

    /// Wrap a payload decode failure as `Corrupt`.
    pub fn corrupt(err: impl std::fmt::Display) -> Self {
        StoreError::Corrupt { message: err.to_string() }
    }
}

/// Errors returned by [`crate::engine::RateLimiter::consume`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// The backend could not answer; the caller's quota was *not* checked.
    /// Distinct from `Decision::Rejected` so middleware can choose
    /// fail-open or fail-closed explicitly.
    #[error(transparent)]
    Backend(#[from] StoreError),
    /// The per-call deadline elapsed before the backend answered.
    #[error("deadline of {deadline:?} elapsed before the backend answered")]
    DeadlineExceeded { deadline: Duration },
    /// The requested cost exceeds a configured capacity and can never
    /// succeed regardless of bucket state. A usage bug, not a transient
    /// rejection; do not retry blindly.
    #[error("cost {cost} exceeds the smallest configured capacity {capacity}")]
    CostExceedsCapacity { cost: u64, capacity: u64 },
}

impl RateLimitError {
    /// Check if this error came from the storage backend.
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Check if this error is a deadline expiry.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// Check if this error is the can-never-succeed cost case.
    pub fn is_invalid_usage(&self) -> bool {
        matches!(self, Self::CostExceedsCapacity { .. })
    }

    /// Borrow the underlying store error if present.
    pub fn as_store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Backend(e) => Some(e),
            _ => None,
        }
    }
}
