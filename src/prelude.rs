//! Convenience re-exports for the common path: build policies, pick a
//! backend, construct the engine, call `consume`.

pub use crate::backend::cas::{CasStore, ClusteredStore, InMemoryCasStore};
pub use crate::backend::memory::MemoryStore;
#[cfg(feature = "redis")]
pub use crate::backend::redis::RedisCasStore;
#[cfg(feature = "sqlite")]
pub use crate::backend::sql::SqliteStore;
pub use crate::backend::StateStore;
pub use crate::bandwidth::{Bandwidth, RefillStyle};
pub use crate::engine::{Decision, RateLimiter};
pub use crate::error::{ConfigError, RateLimitError, StoreError};
pub use crate::key::BucketKey;
pub use crate::observer::{EvictionObserver, EvictionReason, TracingObserver};
pub use crate::policy::{BucketPolicy, PolicyRegistry, RegistryConfig};
