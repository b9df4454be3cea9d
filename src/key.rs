//! Storage keys for bucket state.
//!
//! A [`BucketKey`] is the opaque string a backend stores state under. For a
//! per-caller policy the key combines the caller identifier with the policy
//! name so distinct callers never share tokens; for a shared policy every
//! caller resolves to the policy name alone, which is useful when a single
//! expensive downstream resource needs one global quota.

use crate::policy::BucketPolicy;
use std::fmt;

/// Identifier used when the caller supplied none. Anonymous traffic shares
/// one bucket per policy rather than crashing or minting fresh keys.
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Opaque storage key derived from a policy and a caller identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    /// Derive the key for `caller` under `policy`.
    ///
    /// Deterministic for any input, including a missing identifier.
    pub fn resolve(policy: &BucketPolicy, caller: Option<&str>) -> Self {
        if policy.is_per_caller() {
            let caller = match caller {
                Some(id) if !id.trim().is_empty() => id.trim(),
                _ => ANONYMOUS_CALLER,
            };
            BucketKey(format!("{}-{}", caller, policy.name()))
        } else {
            BucketKey(policy.name().to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrate a key read back from storage.
    pub(crate) fn raw(key: impl Into<String>) -> Self {
        BucketKey(key.into())
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
