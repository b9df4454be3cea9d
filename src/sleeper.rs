//! Abstraction for sleeping between optimistic-retry attempts.
//!
//! Enables fast, deterministic tests of the clustered backend's backoff
//! schedule without real time delays.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping/waiting.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that completes immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Test sleeper that records every requested delay instead of waiting.
#[derive(Debug, Default, Clone)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap().clone()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap().push(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_sleeper_returns_immediately() {
        let start = std::time::Instant::now();
        InstantSleeper.sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tracking_sleeper_records_requested_delays() {
        let sleeper = TrackingSleeper::new();
        sleeper.sleep(Duration::from_millis(5)).await;
        sleeper.sleep(Duration::from_millis(10)).await;
        assert_eq!(
            sleeper.calls(),
            vec![Duration::from_millis(5), Duration::from_millis(10)]
        );
    }

    #[tokio::test]
    async fn tokio_sleeper_actually_waits() {
        let start = std::time::Instant::now();
        TokioSleeper.sleep(Duration::from_millis(50)).await;
        // Small tolerance for timer granularity.
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
