//! Bandwidth: one capacity-plus-refill rule.
//!
//! A [`Bandwidth`] describes a single refillable quota: how many tokens the
//! bucket can hold, how many are added back per refill period, and whether
//! replenishment is continuous ([`RefillStyle::Greedy`]) or happens only at
//! whole-period boundaries ([`RefillStyle::Interval`]).
//!
//! A policy may layer two bandwidths (steady + burst); the consumption logic
//! in [`crate::state`] requires every configured bandwidth to have capacity
//! before a request is allowed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How tokens are replenished over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefillStyle {
    /// Continuous, fractional replenishment proportional to elapsed time.
    Greedy,
    /// Discrete replenishment only once per whole refill period; partial
    /// periods add nothing.
    Interval,
}

impl Default for RefillStyle {
    fn default() -> Self {
        RefillStyle::Greedy
    }
}

/// Errors produced when validating a bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BandwidthError {
    /// Capacity must be > 0.
    #[error("capacity must be > 0")]
    ZeroCapacity,
    /// Refill amount must be > 0.
    #[error("refill amount must be > 0")]
    ZeroRefillAmount,
    /// Refill period must be > 0.
    #[error("refill period must be > 0")]
    ZeroRefillPeriod,
}

/// A validated capacity + refill rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bandwidth {
    capacity: u64,
    refill_amount: u64,
    refill_period: Duration,
    style: RefillStyle,
}

impl Bandwidth {
    /// Create a bandwidth with validation.
    pub fn new(
        capacity: u64,
        refill_amount: u64,
        refill_period: Duration,
        style: RefillStyle,
    ) -> Result<Self, BandwidthError> {
        if capacity == 0 {
            return Err(BandwidthError::ZeroCapacity);
        }
        if refill_amount == 0 {
            return Err(BandwidthError::ZeroRefillAmount);
        }
        if refill_period.is_zero() {
            return Err(BandwidthError::ZeroRefillPeriod);
        }
        Ok(Self { capacity, refill_amount, refill_period, style })
    }

    /// Shorthand for a greedy-refill bandwidth.
    pub fn greedy(
        capacity: u64,
        refill_amount: u64,
        refill_period: Duration,
    ) -> Result<Self, BandwidthError> {
        Self::new(capacity, refill_amount, refill_period, RefillStyle::Greedy)
    }

    /// Shorthand for an interval-refill bandwidth.
    pub fn interval(
        capacity: u64,
        refill_amount: u64,
        refill_period: Duration,
    ) -> Result<Self, BandwidthError> {
        Self::new(capacity, refill_amount, refill_period, RefillStyle::Interval)
    }

    /// Maximum tokens the bucket can hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens added back per refill period.
    pub fn refill_amount(&self) -> u64 {
        self.refill_amount
    }

    /// Length of one refill period.
    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    /// Replenishment style.
    pub fn style(&self) -> RefillStyle {
        self.style
    }

    /// Refill rate in tokens per nanosecond (greedy math).
    pub(crate) fn rate_per_nano(&self) -> f64 {
        self.refill_amount as f64 / self.refill_period.as_nanos() as f64
    }

    /// Time for an empty bucket to refill to full capacity.
    ///
    /// Backends use this as the expiration-after-write TTL: once a key has
    /// been idle this long, recreating it at full capacity is equivalent to
    /// never having expired it.
    pub fn time_to_full(&self) -> Duration {
        match self.style {
            RefillStyle::Greedy => Duration::from_secs_f64(
                self.refill_period.as_secs_f64() * self.capacity as f64
                    / self.refill_amount as f64,
            ),
            RefillStyle::Interval => {
                let periods = self.capacity.div_ceil(self.refill_amount);
                self.refill_period.saturating_mul(u32::try_from(periods).unwrap_or(u32::MAX))
            }
        }
    }
}
