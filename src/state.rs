//! Backend-resident bucket state and the pure refill+consume transition.
//!
//! [`BucketState`] is the value a backend stores per key: one token count
//! and last-refill instant per configured bandwidth. [`BucketState::apply`]
//! is the whole consume algorithm as a pure function of (policy, cost, now,
//! current state); backends run it inside their atomic-update primitive so
//! that, per key, the net effect is a serialized sequence of
//! read-modify-write steps.
//!
//! Token counts are stored as `f64` so greedy refill keeps its fractional
//! carry between calls; reported remaining counts round down.

use crate::bandwidth::{Bandwidth, RefillStyle};
use crate::engine::Decision;
use crate::policy::BucketPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token count and last-refill instant for one bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthState {
    /// Current tokens; `0 <= tokens <= capacity` after every transition.
    pub tokens: f64,
    /// Nanoseconds since epoch of the last refill accounting.
    pub last_refill: u64,
}

impl BandwidthState {
    /// A freshly created bucket starts full.
    pub fn full(bandwidth: &Bandwidth, now: u64) -> Self {
        Self { tokens: bandwidth.capacity() as f64, last_refill: now }
    }

    /// Apply refill for time elapsed up to `now`.
    ///
    /// A clock observed moving backward contributes zero elapsed time.
    pub fn refill(&mut self, bandwidth: &Bandwidth, now: u64) {
        let elapsed = now.saturating_sub(self.last_refill);
        let capacity = bandwidth.capacity() as f64;
        match bandwidth.style() {
            RefillStyle::Greedy => {
                let gained = elapsed as f64 * bandwidth.rate_per_nano();
                self.tokens = (self.tokens + gained).min(capacity);
                // Fractional carry lives in `tokens`, so the refill instant
                // can advance all the way to `now`.
                self.last_refill = now;
            }
            RefillStyle::Interval => {
                let period = bandwidth.refill_period().as_nanos() as u64;
                let periods = elapsed / period;
                if periods > 0 {
                    let gained = periods as f64 * bandwidth.refill_amount() as f64;
                    self.tokens = (self.tokens + gained).min(capacity);
                    // Whole periods only; the partial remainder stays
                    // banked toward the next boundary.
                    self.last_refill += periods * period;
                }
            }
        }
    }

    /// Time until this bandwidth will have `cost` tokens, assuming refill
    /// accounting was just brought up to `now`.
    pub fn wait_for(&self, bandwidth: &Bandwidth, cost: u64, now: u64) -> Duration {
        let deficit = cost as f64 - self.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        match bandwidth.style() {
            RefillStyle::Greedy => {
                let nanos = (deficit / bandwidth.rate_per_nano()).ceil();
                Duration::from_nanos(nanos as u64)
            }
            RefillStyle::Interval => {
                let period = bandwidth.refill_period().as_nanos() as u64;
                let periods = (deficit / bandwidth.refill_amount() as f64).ceil() as u64;
                let boundary = self.last_refill.saturating_add(periods * period);
                Duration::from_nanos(boundary.saturating_sub(now))
            }
        }
    }
}

/// Everything a backend stores for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketState {
    pub steady: BandwidthState,
    pub burst: Option<BandwidthState>,
}

/// Result of one atomic transition: the state to persist plus the decision
/// to report.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub state: BucketState,
    pub decision: Decision,
}

impl BucketState {
    /// Lazily-created state: every bandwidth starts full.
    pub fn full(policy: &BucketPolicy, now: u64) -> Self {
        Self {
            steady: BandwidthState::full(policy.steady(), now),
            burst: policy.burst().map(|bw| BandwidthState::full(bw, now)),
        }
    }

    fn pairs<'a>(
        &'a self,
        policy: &'a BucketPolicy,
    ) -> impl Iterator<Item = (&'a Bandwidth, &'a BandwidthState)> {
        std::iter::once((policy.steady(), &self.steady))
            .chain(policy.burst().zip(self.burst.as_ref()))
    }

    /// The refill+consume transition: refill every bandwidth, then either
    /// decrement all of them (request allowed) or none of them (rejected).
    /// Absent state is created full first.
    pub fn apply(
        policy: &BucketPolicy,
        cost: u64,
        now: u64,
        current: Option<BucketState>,
    ) -> Mutation {
        let mut state = match current {
            Some(state) => state,
            None => BucketState::full(policy, now),
        };

        // Reconcile against a policy whose burst shape changed since the
        // state was written.
        match policy.burst() {
            Some(bw) => {
                if state.burst.is_none() {
                    state.burst = Some(BandwidthState::full(bw, now));
                }
            }
            None => state.burst = None,
        }

        state.steady.refill(policy.steady(), now);
        if let (Some(bw), Some(burst)) = (policy.burst(), state.burst.as_mut()) {
            burst.refill(bw, now);
        }

        let cost_tokens = cost as f64;
        let granted = state.pairs(policy).all(|(_, s)| s.tokens >= cost_tokens);

        if granted {
            state.steady.tokens -= cost_tokens;
            if let Some(burst) = state.burst.as_mut() {
                burst.tokens -= cost_tokens;
            }
            let remaining = state
                .pairs(policy)
                .map(|(_, s)| s.tokens.floor() as u64)
                .min()
                .unwrap_or(0);
            let reset_after = state
                .pairs(policy)
                .map(|(bw, s)| s.wait_for(bw, cost, now))
                .max()
                .unwrap_or(Duration::ZERO);
            Mutation { state, decision: Decision::Allowed { remaining, reset_after } }
        } else {
            // Rejected: persist the refill, keep the tokens.
            let retry_after = state
                .pairs(policy)
                .map(|(bw, s)| s.wait_for(bw, cost, now))
                .max()
                .unwrap_or(Duration::ZERO);
            Mutation { state, decision: Decision::Rejected { retry_after } }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn greedy_policy() -> BucketPolicy {
        // 5 tokens, 5 per 10s: one token every 2s.
        let bw = Bandwidth::greedy(5, 5, Duration::from_secs(10)).unwrap();
        BucketPolicy::new("p", bw)
    }

    fn interval_policy() -> BucketPolicy {
        let bw = Bandwidth::interval(5, 5, Duration::from_secs(10)).unwrap();
        BucketPolicy::new("p", bw)
    }

    #[test]
    fn fresh_bucket_grants_exactly_capacity() {
        let policy = greedy_policy();
        let mut state = None;
        for _ in 0..5 {
            let m = BucketState::apply(&policy, 1, 0, state);
            assert!(m.decision.is_allowed());
            state = Some(m.state);
        }
        let m = BucketState::apply(&policy, 1, 0, state);
        assert!(!m.decision.is_allowed());
    }

    #[test]
    fn sixth_call_reports_two_second_retry() {
        let policy = greedy_policy();
        let mut state = None;
        for _ in 0..5 {
            state = Some(BucketState::apply(&policy, 1, 0, state).state);
        }
        let m = BucketState::apply(&policy, 1, 0, state);
        match m.decision {
            Decision::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(2));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn greedy_half_period_refills_half_the_amount() {
        let policy = greedy_policy();
        let m = BucketState::apply(&policy, 5, 0, None); // drain
        assert!(m.decision.is_allowed());
        let mut state = m.state;
        state.steady.refill(policy.steady(), 5 * SEC);
        assert!((state.steady.tokens - 2.5).abs() < 1e-9);
    }

    #[test]
    fn interval_half_period_refills_nothing() {
        let policy = interval_policy();
        let m = BucketState::apply(&policy, 5, 0, None);
        let mut state = m.state;
        state.steady.refill(policy.steady(), 5 * SEC);
        assert_eq!(state.steady.tokens, 0.0);
        assert_eq!(state.steady.last_refill, 0);
    }

    #[test]
    fn refill_clamps_at_capacity_after_a_full_period() {
        let policy = greedy_policy();
        let m = BucketState::apply(&policy, 3, 0, None);
        let mut state = m.state;
        // Wait far longer than one period; no overflow past capacity.
        state.steady.refill(policy.steady(), 100 * SEC);
        assert_eq!(state.steady.tokens, 5.0);
    }

    #[test]
    fn exactly_one_period_restores_full_capacity() {
        let policy = interval_policy();
        let m = BucketState::apply(&policy, 5, 0, None);
        let mut state = m.state;
        state.steady.refill(policy.steady(), 10 * SEC);
        assert_eq!(state.steady.tokens, 5.0);
        assert_eq!(state.steady.last_refill, 10 * SEC);
    }

    #[test]
    fn interval_last_refill_advances_by_whole_periods_only() {
        let policy = interval_policy();
        let m = BucketState::apply(&policy, 5, 0, None);
        let mut state = m.state;
        state.steady.refill(policy.steady(), 25 * SEC); // 2.5 periods
        assert_eq!(state.steady.last_refill, 20 * SEC);
        assert_eq!(state.steady.tokens, 5.0);
    }

    #[test]
    fn backward_clock_adds_no_tokens() {
        let policy = greedy_policy();
        let m = BucketState::apply(&policy, 2, 10 * SEC, None);
        let mut state = m.state;
        let before = state.steady.tokens;
        state.steady.refill(policy.steady(), 5 * SEC); // clock went backward
        assert_eq!(state.steady.tokens, before);
        assert_eq!(state.steady.last_refill, 5 * SEC);
    }

    #[test]
    fn burst_limits_even_with_steady_headroom() {
        let steady = Bandwidth::greedy(100, 100, Duration::from_secs(60)).unwrap();
        let burst = Bandwidth::interval(2, 2, Duration::from_secs(1)).unwrap();
        let policy = BucketPolicy::new("p", steady).with_burst(burst);

        let m1 = BucketState::apply(&policy, 1, 0, None);
        assert!(m1.decision.is_allowed());
        let m2 = BucketState::apply(&policy, 1, 0, Some(m1.state));
        assert!(m2.decision.is_allowed());
        let m3 = BucketState::apply(&policy, 1, 0, Some(m2.state.clone()));
        assert!(!m3.decision.is_allowed());
        // Steady bandwidth still has plenty.
        assert!(m2.state.steady.tokens >= 98.0);
    }

    #[test]
    fn allowed_remaining_is_the_most_constrained_bandwidth() {
        let steady = Bandwidth::greedy(100, 100, Duration::from_secs(60)).unwrap();
        let burst = Bandwidth::interval(2, 2, Duration::from_secs(1)).unwrap();
        let policy = BucketPolicy::new("p", steady).with_burst(burst);

        let m = BucketState::apply(&policy, 1, 0, None);
        match m.decision {
            Decision::Allowed { remaining, .. } => assert_eq!(remaining, 1),
            other => panic!("expected allowed, got {:?}", other),
        }
    }

    #[test]
    fn rejection_persists_the_refill_without_decrementing() {
        let policy = greedy_policy();
        let drained = BucketState::apply(&policy, 5, 0, None).state;
        // 2s later one token has come back, but cost 2 still fails.
        let m = BucketState::apply(&policy, 2, 2 * SEC, Some(drained));
        assert!(!m.decision.is_allowed());
        assert!((m.state.steady.tokens - 1.0).abs() < 1e-9);
    }

    #[test]
    fn state_missing_a_configured_burst_gets_one_full() {
        let steady = Bandwidth::greedy(5, 5, Duration::from_secs(10)).unwrap();
        let without_burst = BucketPolicy::new("p", steady);
        let stored = BucketState::apply(&without_burst, 1, 0, None).state;
        assert!(stored.burst.is_none());

        let burst = Bandwidth::interval(2, 2, Duration::from_secs(1)).unwrap();
        let with_burst = BucketPolicy::new("p", steady).with_burst(burst);
        let m = BucketState::apply(&with_burst, 1, 0, Some(stored));
        assert!(m.decision.is_allowed());
        assert!(m.state.burst.is_some());
    }

    #[test]
    fn serde_round_trip() {
        let policy = greedy_policy();
        let state = BucketState::apply(&policy, 2, 7 * SEC, None).state;
        let raw = serde_json::to_string(&state).unwrap();
        let back: BucketState = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, state);
    }
}
