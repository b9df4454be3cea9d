//! In-process backend: a sharded map with per-shard locking and
//! expiration-after-write.
//!
//! Keys hash to one of N shards, each guarded by its own mutex, so traffic
//! on different keys rarely contends while updates on one key serialize
//! naturally. State carries an expiry stamp; expired entries are dropped
//! lazily on access and, optionally, by a background sweeper task.
//!
//! This store is not consistent across processes. Use it for
//! single-instance deployments or local development, and a shared backend
//! everywhere else.

use crate::backend::{StateStore, UpdateFn};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::key::BucketKey;
use crate::observer::{EvictionObserver, EvictionReason, NoopObserver};
use crate::state::{BucketState, Mutation};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone)]
struct Entry {
    state: BucketState,
    expires_at: u64,
}

/// Sharded in-process state store.
#[derive(Debug)]
pub struct MemoryStore {
    shards: Box<[Mutex<HashMap<BucketKey, Entry>>]>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn EvictionObserver>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with an explicit shard count (rounded up to 1).
    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        let shards: Vec<_> = (0..shards).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards: shards.into_boxed_slice(),
            clock: Arc::new(SystemClock),
            observer: Arc::new(NoopObserver),
        }
    }

    /// Replace the clock (tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Install an eviction observer.
    pub fn with_observer(mut self, observer: Arc<dyn EvictionObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn shard(&self, key: &BucketKey) -> &Mutex<HashMap<BucketKey, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Drop every expired entry, notifying the observer per key.
    ///
    /// Returns the number of entries reclaimed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_nanos();
        let mut reclaimed = 0;
        for shard in self.shards.iter() {
            let expired: Vec<BucketKey> = {
                let guard = shard.lock().unwrap();
                guard
                    .iter()
                    .filter(|(_, entry)| entry.expires_at <= now)
                    .map(|(key, _)| key.clone())
                    .collect()
            };
            for key in expired {
                // Re-check under the lock: the entry may have been
                // refreshed since we collected it.
                let removed = {
                    let mut guard = shard.lock().unwrap();
                    match guard.get(&key) {
                        Some(entry) if entry.expires_at <= now => guard.remove(&key).is_some(),
                        _ => false,
                    }
                };
                if removed {
                    self.observer.on_eviction(&key, EvictionReason::Expired);
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }

    /// Spawn a background task sweeping expired entries on an interval.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(store) => {
                        let reclaimed = store.sweep();
                        if reclaimed > 0 {
                            tracing::trace!(
                                target: "bucketgate::store",
                                reclaimed,
                                "sweeper reclaimed idle buckets"
                            );
                        }
                    }
                    None => break,
                }
            }
        })
    }

    /// Number of live (possibly expired, not yet reclaimed) keys.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn atomic_update(
        &self,
        key: &BucketKey,
        idle_ttl: Duration,
        apply: UpdateFn,
    ) -> Result<Mutation, StoreError> {
        let now = self.clock.now_nanos();
        let ttl = u64::try_from(idle_ttl.as_nanos()).unwrap_or(u64::MAX);

        let mut guard = self.shard(key).lock().unwrap();

        // Lazy expiry: a stale entry counts as absent.
        let mut expired = false;
        let current = match guard.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.state.clone()),
            Some(_) => {
                expired = true;
                None
            }
            None => None,
        };

        let mutation = apply(current);
        guard.insert(
            key.clone(),
            Entry { state: mutation.state.clone(), expires_at: now.saturating_add(ttl) },
        );
        drop(guard);

        if expired {
            self.observer.on_eviction(key, EvictionReason::Expired);
        }
        Ok(mutation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandwidth::Bandwidth;
    use crate::clock::ManualClock;
    use crate::policy::BucketPolicy;

    fn policy() -> BucketPolicy {
        let bw = Bandwidth::greedy(5, 5, Duration::from_secs(10)).unwrap();
        BucketPolicy::new("p", bw)
    }

    fn update_for(policy: BucketPolicy, cost: u64, now: u64) -> UpdateFn {
        Arc::new(move |current| BucketState::apply(&policy, cost, now, current))
    }

    #[derive(Debug, Default)]
    struct Recording(Mutex<Vec<BucketKey>>);

    impl EvictionObserver for Recording {
        fn on_eviction(&self, key: &BucketKey, _reason: EvictionReason) {
            self.0.lock().unwrap().push(key.clone());
        }
    }

    #[tokio::test]
    async fn persists_state_between_updates() {
        let store = MemoryStore::new().with_clock(Arc::new(ManualClock::new()));
        let key = BucketKey::resolve(&policy(), None);
        let ttl = Duration::from_secs(10);

        for _ in 0..5 {
            let m = store.atomic_update(&key, ttl, update_for(policy(), 1, 0)).await.unwrap();
            assert!(m.decision.is_allowed());
        }
        let m = store.atomic_update(&key, ttl, update_for(policy(), 1, 0)).await.unwrap();
        assert!(!m.decision.is_allowed());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_recreated_full() {
        let clock = Arc::new(ManualClock::new());
        let observer = Arc::new(Recording::default());
        let store = MemoryStore::new()
            .with_clock(clock.clone())
            .with_observer(observer.clone());
        let key = BucketKey::resolve(&policy(), None);
        let ttl = Duration::from_secs(10);

        // Drain the bucket entirely.
        let m = store.atomic_update(&key, ttl, update_for(policy(), 5, 0)).await.unwrap();
        assert!(m.decision.is_allowed());

        // Idle past the TTL; next access sees a fresh, full bucket.
        clock.advance(Duration::from_secs(11));
        let now = clock.now_nanos();
        let m = store.atomic_update(&key, ttl, update_for(policy(), 5, now)).await.unwrap();
        assert!(m.decision.is_allowed());
        assert_eq!(observer.0.lock().unwrap().as_slice(), &[key]);
    }

    #[tokio::test]
    async fn sweep_reclaims_only_expired_keys() {
        let clock = Arc::new(ManualClock::new());
        let observer = Arc::new(Recording::default());
        let store = MemoryStore::new()
            .with_clock(clock.clone())
            .with_observer(observer.clone());
        let ttl_short = Duration::from_secs(5);
        let ttl_long = Duration::from_secs(60);

        let short = BucketKey::resolve(&policy(), None);
        let long_policy = BucketPolicy::new(
            "other",
            Bandwidth::greedy(5, 5, Duration::from_secs(10)).unwrap(),
        );
        let long = BucketKey::resolve(&long_policy, None);

        store.atomic_update(&short, ttl_short, update_for(policy(), 1, 0)).await.unwrap();
        store.atomic_update(&long, ttl_long, update_for(long_policy, 1, 0)).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(observer.0.lock().unwrap().as_slice(), &[short]);
    }

    #[tokio::test]
    async fn sweeper_task_runs_and_stops_with_the_store() {
        let clock = Arc::new(ManualClock::new());
        let observer = Arc::new(Recording::default());
        let store = Arc::new(
            MemoryStore::new().with_clock(clock.clone()).with_observer(observer.clone()),
        );
        let key = BucketKey::resolve(&policy(), None);
        store
            .atomic_update(&key, Duration::from_secs(1), update_for(policy(), 1, 0))
            .await
            .unwrap();

        let handle = store.spawn_sweeper(Duration::from_millis(10));
        clock.advance(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());
        assert_eq!(observer.0.lock().unwrap().len(), 1);

        drop(store);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should exit after the store is dropped")
            .unwrap();
    }

    #[test]
    fn shard_count_is_clamped_to_at_least_one() {
        let store = MemoryStore::with_shards(0);
        assert_eq!(store.shards.len(), 1);
    }
}
