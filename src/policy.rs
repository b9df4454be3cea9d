//! Bucket policies and the startup-loaded registry.
//!
//! A [`BucketPolicy`] names a steady [`Bandwidth`], an optional burst
//! bandwidth layered on top, and whether each caller gets an isolated
//! bucket. Policies are immutable once loaded into a [`PolicyRegistry`];
//! lookup never fails because unknown names fall back to a mandatory
//! default policy.
//!
//! Configuration arrives through [`RegistryConfig`], deserializable from
//! JSON with camelCase field names (`refillAmount`, `perCaller`, ...).
//! Validation is strict and happens once, at load: a non-positive capacity,
//! refill amount, or period is a fatal [`ConfigError`].

use crate::bandwidth::{Bandwidth, RefillStyle};
use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Name under which the fallback policy is registered and keyed.
///
/// All unknown policy names resolve to this policy *and* share its bucket
/// family, so a typo in a call site cannot mint unlimited fresh buckets.
pub const DEFAULT_POLICY_NAME: &str = "__default__";

/// One named rate-limit policy: steady bandwidth, optional burst bandwidth,
/// and per-caller isolation.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketPolicy {
    name: String,
    steady: Bandwidth,
    burst: Option<Bandwidth>,
    per_caller: bool,
}

impl BucketPolicy {
    /// Create a policy with just a steady bandwidth, shared across callers.
    pub fn new(name: impl Into<String>, steady: Bandwidth) -> Self {
        Self { name: name.into(), steady, burst: None, per_caller: false }
    }

    /// Layer a burst bandwidth on top; a request must satisfy both.
    pub fn with_burst(mut self, burst: Bandwidth) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Give each distinct caller identifier its own bucket.
    pub fn per_caller(mut self, per_caller: bool) -> Self {
        self.per_caller = per_caller;
        self
    }

    /// Policy name; doubles as the key suffix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steady bandwidth.
    pub fn steady(&self) -> &Bandwidth {
        &self.steady
    }

    /// Burst bandwidth, if configured.
    pub fn burst(&self) -> Option<&Bandwidth> {
        self.burst.as_ref()
    }

    /// Whether each caller gets an isolated bucket.
    pub fn is_per_caller(&self) -> bool {
        self.per_caller
    }

    /// Steady bandwidth first, then burst if present.
    pub fn bandwidths(&self) -> impl Iterator<Item = &Bandwidth> {
        std::iter::once(&self.steady).chain(self.burst.as_ref())
    }

    /// Smallest capacity across configured bandwidths. A cost above this
    /// can never be satisfied.
    pub fn min_capacity(&self) -> u64 {
        self.bandwidths().map(Bandwidth::capacity).min().unwrap_or(0)
    }

    /// How long an idle bucket takes to refill to full capacity.
    ///
    /// Backends use this as the expiration-after-write TTL; once this much
    /// time has passed with no traffic, dropping the state and recreating
    /// it full is indistinguishable from having kept it.
    pub fn idle_ttl(&self) -> Duration {
        self.bandwidths().map(Bandwidth::time_to_full).max().unwrap_or(Duration::ZERO)
    }
}

/// Immutable name → policy table with a mandatory default.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<BucketPolicy>>,
    default_policy: Arc<BucketPolicy>,
}

impl PolicyRegistry {
    /// Build a registry from already-validated policies.
    ///
    /// The default policy is re-registered under [`DEFAULT_POLICY_NAME`]
    /// regardless of the name it was built with.
    pub fn new(
        default_policy: BucketPolicy,
        policies: impl IntoIterator<Item = BucketPolicy>,
    ) -> Result<Self, ConfigError> {
        let mut default_policy = default_policy;
        default_policy.name = DEFAULT_POLICY_NAME.to_string();
        let default_policy = Arc::new(default_policy);

        let mut table = HashMap::new();
        for policy in policies {
            let name = policy.name.clone();
            if table.insert(name.clone(), Arc::new(policy)).is_some() {
                return Err(ConfigError::DuplicatePolicy { name });
            }
        }
        Ok(Self { policies: table, default_policy })
    }

    /// Look up a policy by name. Unknown or unconfigured names resolve to
    /// the default policy; resolution never fails.
    pub fn resolve(&self, name: &str) -> &Arc<BucketPolicy> {
        self.policies.get(name.trim()).unwrap_or(&self.default_policy)
    }

    /// The fallback policy.
    pub fn default_policy(&self) -> &Arc<BucketPolicy> {
        &self.default_policy
    }

    /// Number of named policies, excluding the default.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Validate and load a registry from configuration.
    pub fn from_config(config: RegistryConfig) -> Result<Self, ConfigError> {
        let default_policy = config.default.build(DEFAULT_POLICY_NAME)?;
        let mut policies = Vec::with_capacity(config.policies.len());
        for entry in &config.policies {
            policies.push(entry.build(&entry.name)?);
        }
        Self::new(default_policy, policies)
    }
}

/// Deserializable registry configuration: one default entry plus any number
/// of named policies.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Policy applied to unrecognized names.
    pub default: PolicyConfig,
    /// Named policies.
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl RegistryConfig {
    /// Parse from a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// One policy entry as it appears in configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Policy name; ignored for the default entry.
    #[serde(default)]
    pub name: String,
    pub capacity: u64,
    pub refill_amount: u64,
    pub refill_period_seconds: u64,
    #[serde(default)]
    pub style: RefillStyle,
    pub burst_capacity: Option<u64>,
    pub burst_refill_amount: Option<u64>,
    pub burst_refill_period_seconds: Option<u64>,
    #[serde(default)]
    pub per_caller: bool,
}

impl PolicyConfig {
    fn build(&self, name: &str) -> Result<BucketPolicy, ConfigError> {
        let steady = Bandwidth::new(
            self.capacity,
            self.refill_amount,
            Duration::from_secs(self.refill_period_seconds),
            self.style,
        )
        .map_err(|source| ConfigError::InvalidBandwidth { policy: name.to_string(), source })?;

        let mut policy = BucketPolicy::new(name, steady).per_caller(self.per_caller);

        match (self.burst_capacity, self.burst_refill_amount, self.burst_refill_period_seconds) {
            (None, None, None) => {}
            (Some(capacity), Some(amount), Some(period)) => {
                // Burst protects against short spikes, so it refills all at
                // once at period boundaries.
                let burst =
                    Bandwidth::interval(capacity, amount, Duration::from_secs(period)).map_err(
                        |source| ConfigError::InvalidBandwidth { policy: name.to_string(), source },
                    )?;
                policy = policy.with_burst(burst);
            }
            _ => return Err(ConfigError::IncompleteBurst { policy: name.to_string() }),
        }

        Ok(policy)
    }
}
