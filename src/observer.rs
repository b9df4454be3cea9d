//! Best-effort hooks for backend-driven eviction of idle bucket state.
//!
//! Backends that can see their own expiry (the in-process map and the SQL
//! adapter) call the observer when they reclaim a key. Purely
//! observational: correctness never depends on the observer existing,
//! firing, or behaving. Stores that expire server-side (Redis TTL) cannot
//! report evictions and simply never call it.
//!
//! Observers are passed into an adapter at construction; there is no
//! ambient global listener.

use crate::key::BucketKey;

/// Why a backend dropped a key's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// The key sat idle past its expiration-after-write TTL. The bucket
    /// would have refilled to full anyway, so dropping it is free.
    Expired,
}

/// Receives `(key, reason)` when the active backend reclaims idle state.
pub trait EvictionObserver: Send + Sync + std::fmt::Debug {
    fn on_eviction(&self, key: &BucketKey, reason: EvictionReason);
}

/// Observer that logs each eviction at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl EvictionObserver for TracingObserver {
    fn on_eviction(&self, key: &BucketKey, reason: EvictionReason) {
        tracing::debug!(
            target: "bucketgate::store",
            key = %key,
            ?reason,
            "idle bucket state reclaimed"
        );
    }
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl EvictionObserver for NoopObserver {
    fn on_eviction(&self, _key: &BucketKey, _reason: EvictionReason) {}
}
