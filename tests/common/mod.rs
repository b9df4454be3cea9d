//! Shared helpers for integration tests.
#![allow(dead_code)] // each test binary uses a different subset

use bucketgate::backend::{StateStore, UpdateFn};
use bucketgate::clock::ManualClock;
use bucketgate::error::StoreError;
use bucketgate::key::BucketKey;
use bucketgate::state::Mutation;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Generous deadline for tests that are not about deadlines.
pub const DEADLINE: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new())
}

/// Backend that simulates an outage: every update fails.
#[derive(Debug)]
pub struct FailingStore;

#[async_trait]
impl StateStore for FailingStore {
    async fn atomic_update(
        &self,
        _key: &BucketKey,
        _idle_ttl: Duration,
        _apply: UpdateFn,
    ) -> Result<Mutation, StoreError> {
        Err(StoreError::unavailable("simulated outage"))
    }
}

/// Backend that never answers within any reasonable deadline.
#[derive(Debug)]
pub struct StalledStore;

#[async_trait]
impl StateStore for StalledStore {
    async fn atomic_update(
        &self,
        _key: &BucketKey,
        _idle_ttl: Duration,
        _apply: UpdateFn,
    ) -> Result<Mutation, StoreError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(StoreError::unavailable("unreachable"))
    }
}
