//! The token bucket engine: policy resolution, key derivation, and atomic
//! consumption through the active backend.
//!
//! [`RateLimiter`] is what request middleware calls, once per request:
//!
//! ```rust
//! use bucketgate::backend::memory::MemoryStore;
//! use bucketgate::bandwidth::Bandwidth;
//! use bucketgate::engine::{Decision, RateLimiter};
//! use bucketgate::policy::{BucketPolicy, PolicyRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let steady = Bandwidth::greedy(100, 100, Duration::from_secs(60)).unwrap();
//!     let registry = PolicyRegistry::new(
//!         BucketPolicy::new("default", steady),
//!         vec![BucketPolicy::new("search", steady).per_caller(true)],
//!     )
//!     .unwrap();
//!     let limiter = RateLimiter::new(registry, Arc::new(MemoryStore::new()));
//!
//!     match limiter
//!         .consume("search", Some("alice"), 1, Duration::from_secs(3))
//!         .await
//!     {
//!         Ok(Decision::Allowed { remaining, .. }) => println!("go ({remaining} left)"),
//!         Ok(Decision::Rejected { retry_after }) => println!("429, retry in {retry_after:?}"),
//!         Err(err) => eprintln!("quota check failed: {err}"),
//!     }
//! }
//! ```
//!
//! The engine holds no global lock; all coordination is scoped to the one
//! key being touched and delegated to the backend's atomic-update
//! primitive. The whole consume path is bounded by the caller's deadline.

use crate::backend::{StateStore, UpdateFn};
use crate::clock::{Clock, SystemClock};
use crate::error::RateLimitError;
use crate::key::BucketKey;
use crate::policy::PolicyRegistry;
use crate::state::BucketState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The outcome of a quota check.
///
/// Backend failures are *not* decisions; they surface as
/// [`RateLimitError`] so callers can't mistake "we couldn't check" for
/// "you are over quota".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed {
        /// Tokens left in the most-constrained bandwidth
        /// (`X-RateLimit-Remaining`).
        remaining: u64,
        /// Time until an identical request would next be admissible; zero
        /// while tokens remain.
        reset_after: Duration,
    },
    /// Over quota. Expected, not a fault.
    Rejected {
        /// How long to wait before the most-constrained bandwidth can
        /// cover the cost (`Retry-After`).
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Remaining tokens when allowed.
    pub fn remaining(&self) -> Option<u64> {
        match self {
            Decision::Allowed { remaining, .. } => Some(*remaining),
            Decision::Rejected { .. } => None,
        }
    }

    /// Suggested wait when rejected.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Rejected { retry_after } => Some(*retry_after),
            Decision::Allowed { .. } => None,
        }
    }
}

/// Running tally of consume outcomes, for metrics scraping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeStats {
    pub allowed: u64,
    pub rejected: u64,
    pub errors: u64,
}

/// Orchestrates policy registry, key resolver, and the active backend.
pub struct RateLimiter {
    registry: PolicyRegistry,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    allowed: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("registry", &self.registry)
            .field("store", &self.store)
            .finish()
    }
}

impl RateLimiter {
    /// Create an engine over the chosen backend. Backend selection is a
    /// deployment-time decision made here, at process composition; callers
    /// of [`consume`](Self::consume) are oblivious to it.
    pub fn new(registry: PolicyRegistry, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            clock: Arc::new(SystemClock),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The loaded policy table.
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Outcome counters since construction.
    pub fn stats(&self) -> ConsumeStats {
        ConsumeStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Attempt to consume `cost` tokens for `caller` under the named
    /// policy, giving the backend at most `deadline` to answer.
    ///
    /// Unknown policy names use the default policy. A missing caller
    /// identifier is treated as a fixed anonymous caller. A deadline
    /// expiry returns [`RateLimitError::DeadlineExceeded`], never a false
    /// decision.
    pub async fn consume(
        &self,
        policy_name: &str,
        caller: Option<&str>,
        cost: u64,
        deadline: Duration,
    ) -> Result<Decision, RateLimitError> {
        let policy = Arc::clone(self.registry.resolve(policy_name));

        // A cost no bandwidth can ever hold is a usage bug: fail before
        // touching the backend so it is never retried as transient.
        let capacity = policy.min_capacity();
        if cost > capacity {
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(RateLimitError::CostExceedsCapacity { cost, capacity });
        }

        let key = BucketKey::resolve(&policy, caller);
        let now = self.clock.now_nanos();
        let idle_ttl = policy.idle_ttl();
        let apply: UpdateFn = {
            let policy = Arc::clone(&policy);
            Arc::new(move |current| BucketState::apply(&policy, cost, now, current))
        };

        let update = self.store.atomic_update(&key, idle_ttl, apply);
        let mutation = match tokio::time::timeout(deadline, update).await {
            Ok(Ok(mutation)) => mutation,
            Ok(Err(err)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "bucketgate::engine",
                    policy = policy.name(),
                    key = %key,
                    error = %err,
                    "backend failed during consume"
                );
                return Err(err.into());
            }
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "bucketgate::engine",
                    policy = policy.name(),
                    key = %key,
                    ?deadline,
                    "deadline elapsed before the backend answered"
                );
                return Err(RateLimitError::DeadlineExceeded { deadline });
            }
        };

        match &mutation.decision {
            Decision::Allowed { remaining, .. } => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target: "bucketgate::engine",
                    policy = policy.name(),
                    key = %key,
                    cost,
                    remaining,
                    "token consumed"
                );
            }
            Decision::Rejected { retry_after } => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target: "bucketgate::engine",
                    policy = policy.name(),
                    key = %key,
                    cost,
                    ?retry_after,
                    "over quota"
                );
            }
        }
        Ok(mutation.decision)
    }
}
