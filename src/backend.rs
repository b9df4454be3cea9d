//! Pluggable storage backends for bucket state.
//!
//! Every adapter satisfies one contract, [`StateStore`]: run the pure
//! refill+consume transition against the stored state for a key as one
//! atomic unit. No two concurrent callers on the same key may interleave a
//! read and a write; the net effect must be as if all updates for that key
//! were serialized. Different keys have no ordering relationship.
//!
//! Shipped adapters:
//! - [`memory::MemoryStore`] — sharded in-process map. Single-instance
//!   deployments and local development; not consistent across processes.
//! - [`cas::ClusteredStore`] — bounded optimistic-retry loop over any
//!   versioned key-value store ([`cas::CasStore`]); pair it with
//!   `redis::RedisCasStore` (feature `redis`) for a fleet-shared limiter.
//! - `sql::SqliteStore` (feature `sqlite`, on by default) — relational
//!   adapter using a short row-locking transaction.
//!
//! Backend selection is a deployment-time choice made at process
//! composition: construct one adapter and hand it to the engine. The
//! engine and callers are oblivious to which one is active.

use crate::error::StoreError;
use crate::key::BucketKey;
use crate::state::{BucketState, Mutation};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod cas;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "sqlite")]
pub mod sql;

/// The pure transition a store runs inside its atomic section: current
/// state (`None` when the key is absent or expired) to the state to
/// persist plus the decision to report.
///
/// `Arc` rather than a plain reference so adapters that offload to a
/// blocking thread can carry it across the boundary.
pub type UpdateFn = Arc<dyn Fn(Option<BucketState>) -> Mutation + Send + Sync>;

/// Atomic read-modify-write over one key's bucket state.
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Atomically apply `apply` to the state under `key` and persist the
    /// result, stamped to expire `idle_ttl` after this write.
    ///
    /// Must block only for the duration of one backend round trip; lock
    /// waits and retry loops are bounded and surface as [`StoreError`]
    /// rather than hanging the caller.
    async fn atomic_update(
        &self,
        key: &BucketKey,
        idle_ttl: Duration,
        apply: UpdateFn,
    ) -> Result<Mutation, StoreError>;
}
