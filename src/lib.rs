#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bucketgate
//!
//! Distributed token-bucket rate limiting: let every instance of a
//! horizontally-scaled service enforce one shared quota per caller, with
//! atomic token consumption across processes.
//!
//! ## Features
//!
//! - **Token bucket policies** with greedy (continuous) or interval
//!   (whole-period) refill, plus an optional burst bandwidth layered on
//!   top — a request must satisfy both
//! - **Per-caller or shared buckets** per policy
//! - **Pluggable backends** behind one atomic-update contract: sharded
//!   in-process map, optimistic-CAS clustered store (Redis), or a
//!   row-locking relational store (SQLite)
//! - **Self-cleaning state**: every write carries an
//!   expiration-after-write TTL equal to the bucket's refill-to-full time
//! - **Honest failure modes**: over-quota is a decision, backend trouble
//!   is an error, and an impossible cost is neither
//!
//! ## Quick start
//!
//! ```rust
//! use bucketgate::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let steady = Bandwidth::greedy(60, 60, Duration::from_secs(60)).unwrap();
//!     let registry = PolicyRegistry::new(
//!         BucketPolicy::new("default", steady),
//!         vec![BucketPolicy::new("search", steady).per_caller(true)],
//!     )
//!     .unwrap();
//!
//!     let limiter = RateLimiter::new(registry, Arc::new(MemoryStore::new()));
//!     let decision = limiter
//!         .consume("search", Some("alice"), 1, Duration::from_secs(3))
//!         .await
//!         .unwrap();
//!     assert!(decision.is_allowed());
//! }
//! ```

pub mod backend;
pub mod bandwidth;
pub mod clock;
pub mod engine;
pub mod error;
pub mod key;
pub mod observer;
pub mod policy;
pub mod prelude;
pub mod sleeper;
pub mod state;

// Re-exports
pub use backend::memory::MemoryStore;
pub use backend::StateStore;
pub use bandwidth::{Bandwidth, BandwidthError, RefillStyle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{ConsumeStats, Decision, RateLimiter};
pub use error::{ConfigError, RateLimitError, StoreError};
pub use key::BucketKey;
pub use observer::{EvictionObserver, EvictionReason, NoopObserver, TracingObserver};
pub use policy::{BucketPolicy, PolicyConfig, PolicyRegistry, RegistryConfig};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use state::{BandwidthState, BucketState, Mutation};
