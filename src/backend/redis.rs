//! Redis implementation of [`CasStore`] (feature `redis`).
//!
//! Bring your own `redis::Client`; state is stored as JSON with an
//! embedded version counter under `{namespace}:{key}`. Conditional writes
//! use the WATCH/MULTI/EXEC pattern: the key is watched, the version
//! re-checked, and the write aborted by the server if anyone touched the
//! key in between. Every write carries a PX expiry equal to the bucket's
//! refill-to-full time, so idle keys vanish server-side without a sweeper.
//!
//! The `redis` crate's plain connections are blocking, so each operation
//! runs on the tokio blocking pool. Transport failures surface as
//! [`StoreError::Unavailable`]; undecodable payloads as
//! [`StoreError::Corrupt`].

use crate::backend::cas::{CasStore, VersionedState};
use crate::error::StoreError;
use crate::key::BucketKey;
use crate::state::BucketState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_NAMESPACE: &str = "bucketgate";

/// What actually lands in Redis: the state plus its version counter.
#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    version: u64,
    state: BucketState,
}

/// [`CasStore`] backed by a Redis server or cluster.
#[derive(Clone)]
pub struct RedisCasStore {
    client: redis::Client,
    namespace: String,
}

impl std::fmt::Debug for RedisCasStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCasStore")
            .field("namespace", &self.namespace)
            .field("client", &"<redis::Client>")
            .finish()
    }
}

impl RedisCasStore {
    /// Create a store using an existing client.
    pub fn new(client: redis::Client) -> Self {
        Self { client, namespace: DEFAULT_NAMESPACE.to_string() }
    }

    /// Key prefix, letting several applications share one Redis.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn storage_key(&self, key: &BucketKey) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn decode(raw: &str) -> Result<Payload, StoreError> {
        serde_json::from_str(raw).map_err(StoreError::corrupt)
    }
}

#[async_trait]
impl CasStore for RedisCasStore {
    async fn load(&self, key: &BucketKey) -> Result<Option<VersionedState>, StoreError> {
        let client = self.client.clone();
        let storage_key = self.storage_key(key);
        tokio::task::spawn_blocking(move || {
            let mut con = client.get_connection().map_err(StoreError::unavailable)?;
            let raw: Option<String> = redis::cmd("GET")
                .arg(&storage_key)
                .query(&mut con)
                .map_err(StoreError::unavailable)?;
            raw.map(|raw| {
                let payload = Self::decode(&raw)?;
                Ok(VersionedState { state: payload.state, version: payload.version })
            })
            .transpose()
        })
        .await
        .map_err(StoreError::unavailable)?
    }

    async fn store(
        &self,
        key: &BucketKey,
        state: &BucketState,
        ttl: Duration,
        expected: Option<u64>,
    ) -> Result<bool, StoreError> {
        let client = self.client.clone();
        let storage_key = self.storage_key(key);
        let next_version = expected.map_or(1, |v| v.wrapping_add(1));
        let payload = serde_json::to_string(&Payload { version: next_version, state: state.clone() })
            .map_err(StoreError::corrupt)?;
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        tokio::task::spawn_blocking(move || {
            let mut con = client.get_connection().map_err(StoreError::unavailable)?;

            // Watch first so any concurrent write aborts our EXEC.
            redis::cmd("WATCH")
                .arg(&storage_key)
                .query::<()>(&mut con)
                .map_err(StoreError::unavailable)?;

            let raw: Option<String> = redis::cmd("GET")
                .arg(&storage_key)
                .query(&mut con)
                .map_err(StoreError::unavailable)?;
            let live_version = raw.as_deref().map(Self::decode).transpose()?.map(|p| p.version);
            if live_version != expected {
                redis::cmd("UNWATCH")
                    .query::<()>(&mut con)
                    .map_err(StoreError::unavailable)?;
                return Ok(false);
            }

            // EXEC returns nil (None here) when the watched key changed.
            let committed: Option<()> = redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(&storage_key)
                .arg(&payload)
                .arg("PX")
                .arg(ttl_millis)
                .ignore()
                .query(&mut con)
                .map_err(StoreError::unavailable)?;
            Ok(committed.is_some())
        })
        .await
        .map_err(StoreError::unavailable)?
    }
}
