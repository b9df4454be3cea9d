//! No-double-spend under concurrency: T tasks racing one fresh bucket of
//! capacity C (T > C) must see exactly C grants and T−C rejections, on
//! every backend adapter.

mod common;

use bucketgate::prelude::*;
use common::DEADLINE;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

const TASKS: usize = 64;
const CAPACITY: u64 = 10;

fn registry() -> PolicyRegistry {
    let steady = Bandwidth::greedy(CAPACITY, CAPACITY, Duration::from_secs(60)).unwrap();
    PolicyRegistry::new(
        BucketPolicy::new("default", steady),
        vec![BucketPolicy::new("race", steady)],
    )
    .unwrap()
}

async fn race(store: Arc<dyn StateStore>) -> (usize, usize) {
    common::init_tracing();
    let limiter = Arc::new(RateLimiter::new(registry(), store));

    let tasks: Vec<_> = (0..TASKS)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter.consume("race", None, 1, DEADLINE).await
            })
        })
        .collect();

    let mut allowed = 0;
    let mut rejected = 0;
    for outcome in join_all(tasks).await {
        match outcome.expect("task must not panic").expect("no backend errors expected") {
            Decision::Allowed { .. } => allowed += 1,
            Decision::Rejected { .. } => rejected += 1,
        }
    }
    (allowed, rejected)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn memory_store_never_double_spends() {
    let (allowed, rejected) = race(Arc::new(MemoryStore::new())).await;
    assert_eq!(allowed, CAPACITY as usize);
    assert_eq!(rejected, TASKS - CAPACITY as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn clustered_store_never_double_spends() {
    // With TASKS attempts every racer is guaranteed to finish: each lost
    // CAS round means some other racer committed, and only TASKS commits
    // can ever happen.
    let store = ClusteredStore::new(InMemoryCasStore::new())
        .with_max_attempts(TASKS as u32)
        .with_backoff(Duration::from_micros(50));
    let (allowed, rejected) = race(Arc::new(store)).await;
    assert_eq!(allowed, CAPACITY as usize);
    assert_eq!(rejected, TASKS - CAPACITY as usize);
}

#[cfg(feature = "sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn sqlite_store_never_double_spends() {
    let store = SqliteStore::open_in_memory().unwrap();
    let (allowed, rejected) = race(Arc::new(store)).await;
    assert_eq!(allowed, CAPACITY as usize);
    assert_eq!(rejected, TASKS - CAPACITY as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn per_caller_buckets_race_independently() {
    common::init_tracing();
    let steady = Bandwidth::greedy(CAPACITY, CAPACITY, Duration::from_secs(60)).unwrap();
    let registry = PolicyRegistry::new(
        BucketPolicy::new("default", steady),
        vec![BucketPolicy::new("race", steady).per_caller(true)],
    )
    .unwrap();
    let limiter = Arc::new(RateLimiter::new(registry, Arc::new(MemoryStore::new())));

    let tasks: Vec<_> = (0..TASKS)
        .map(|i| {
            let limiter = Arc::clone(&limiter);
            let caller = if i % 2 == 0 { "alice" } else { "bob" };
            tokio::spawn(async move {
                (caller, limiter.consume("race", Some(caller), 1, DEADLINE).await)
            })
        })
        .collect();

    let mut granted_per_caller = std::collections::HashMap::new();
    for outcome in join_all(tasks).await {
        let (caller, decision) = outcome.unwrap();
        if decision.unwrap().is_allowed() {
            *granted_per_caller.entry(caller).or_insert(0u64) += 1;
        }
    }
    assert_eq!(granted_per_caller["alice"], CAPACITY);
    assert_eq!(granted_per_caller["bob"], CAPACITY);
}
