//! Clustered backend: bounded optimistic retries over a versioned
//! key-value store.
//!
//! The adapter is split in two so the retry logic can be tested without a
//! live cluster:
//!
//! - [`CasStore`] is the narrow contract a replicated store must offer:
//!   read a value with a version token, and write conditioned on that
//!   version being unchanged (compare-and-set), with a TTL.
//! - [`ClusteredStore`] turns any `CasStore` into a [`StateStore`] via a
//!   read-compute-conditional-write loop: on conflict it reloads and
//!   retries up to a fixed attempt budget, sleeping a jittered,
//!   exponentially growing backoff between attempts. Exhausting the budget
//!   surfaces as [`StoreError::ContentionExhausted`], never an unbounded
//!   loop.
//!
//! The TTL handed to every write is the bucket's refill-to-full time, so
//! idle keys self-clean inside the cluster without an external sweeper.
//! Server-side expiry is invisible to this process, so no eviction
//! observer fires here.
//!
//! `redis::RedisCasStore` (feature `redis`) implements [`CasStore`] against
//! Redis; [`InMemoryCasStore`] is a process-local implementation for tests
//! and development.

use crate::backend::{StateStore, UpdateFn};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::key::BucketKey;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::state::{BucketState, Mutation};
use async_trait::async_trait;
use rand::{rng, Rng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 8;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Bucket state plus the version token it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedState {
    pub state: BucketState,
    pub version: u64,
}

/// Minimal contract for a replicated key-value store with conditional
/// writes. Implementations bring their own client.
#[async_trait]
pub trait CasStore: Send + Sync + std::fmt::Debug {
    /// Read the current state and its version, or `None` when the key is
    /// absent (never written, or expired server-side).
    async fn load(&self, key: &BucketKey) -> Result<Option<VersionedState>, StoreError>;

    /// Write `state` with `ttl`, conditioned on the key's version still
    /// being `expected` (`None` means the key must still be absent).
    ///
    /// Returns `false` when the condition failed and the caller should
    /// reload and retry.
    async fn store(
        &self,
        key: &BucketKey,
        state: &BucketState,
        ttl: Duration,
        expected: Option<u64>,
    ) -> Result<bool, StoreError>;
}

/// [`StateStore`] adapter running a bounded optimistic-retry loop over any
/// [`CasStore`].
#[derive(Debug)]
pub struct ClusteredStore<S> {
    inner: S,
    max_attempts: u32,
    backoff: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl<S> ClusteredStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Attempt budget before giving up with `ContentionExhausted`
    /// (clamped to at least 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Base backoff; the delay before attempt *n* is drawn uniformly from
    /// `0..=backoff * 2^(n-1)`, capped at 250ms.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the sleeper (tests).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Access the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let ceiling = self
            .backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF);
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        // Full jitter: uniform in [0, ceiling].
        Duration::from_nanos(rng().random_range(0..=nanos))
    }
}

#[async_trait]
impl<S: CasStore> StateStore for ClusteredStore<S> {
    async fn atomic_update(
        &self,
        key: &BucketKey,
        idle_ttl: Duration,
        apply: UpdateFn,
    ) -> Result<Mutation, StoreError> {
        for attempt in 0..self.max_attempts {
            let loaded = self.inner.load(key).await?;
            let (current, expected) = match loaded {
                Some(v) => (Some(v.state), Some(v.version)),
                None => (None, None),
            };

            let mutation = apply(current);
            if self.inner.store(key, &mutation.state, idle_ttl, expected).await? {
                return Ok(mutation);
            }

            tracing::trace!(
                target: "bucketgate::store",
                key = %key,
                attempt,
                "optimistic update lost a race, retrying"
            );
            if attempt + 1 < self.max_attempts {
                self.sleeper.sleep(self.jittered_delay(attempt)).await;
            }
        }
        Err(StoreError::ContentionExhausted { attempts: self.max_attempts })
    }
}

#[derive(Debug, Clone)]
struct CasEntry {
    state: BucketState,
    version: u64,
    expires_at: u64,
}

/// Process-local [`CasStore`] with real version conflicts and TTL expiry.
///
/// Useful for tests and single-process development; production clusters
/// should use a shared implementation such as `RedisCasStore`.
#[derive(Debug)]
pub struct InMemoryCasStore {
    data: Mutex<HashMap<BucketKey, CasEntry>>,
    clock: Arc<dyn Clock>,
    next_version: Mutex<u64>,
}

impl Default for InMemoryCasStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCasStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            next_version: Mutex::new(1),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn bump_version(&self) -> u64 {
        let mut guard = self.next_version.lock().unwrap();
        let version = *guard;
        *guard += 1;
        version
    }
}

#[async_trait]
impl CasStore for InMemoryCasStore {
    async fn load(&self, key: &BucketKey) -> Result<Option<VersionedState>, StoreError> {
        let now = self.clock.now_nanos();
        let guard = self.data.lock().unwrap();
        Ok(guard.get(key).and_then(|entry| {
            (entry.expires_at > now)
                .then(|| VersionedState { state: entry.state.clone(), version: entry.version })
        }))
    }

    async fn store(
        &self,
        key: &BucketKey,
        state: &BucketState,
        ttl: Duration,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_nanos();
        let ttl = u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX);
        let version = self.bump_version();

        let mut guard = self.data.lock().unwrap();
        let live_version = guard
            .get(key)
            .and_then(|entry| (entry.expires_at > now).then_some(entry.version));
        if live_version != expected {
            return Ok(false);
        }
        guard.insert(
            key.clone(),
            CasEntry { state: state.clone(), version, expires_at: now.saturating_add(ttl) },
        );
        Ok(true)
    }
}
