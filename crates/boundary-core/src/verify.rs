//! Live state oracles consulted at execution time.
//!
//! Verifiers are untrusted and re-queried on every execution attempt; nothing
//! here caches an answer.

use crate::error::BoundaryError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Answers "what is the circle's policy hash right now?".
pub trait PolicyVerifier: Send + Sync {
    fn live_policy_hash(
        &self,
        circle_id: &str,
        intersection_id: Option<&str>,
    ) -> Result<String, BoundaryError>;
}

impl<F> PolicyVerifier for F
where
    F: Fn(&str, Option<&str>) -> Result<String, BoundaryError> + Send + Sync,
{
    fn live_policy_hash(
        &self,
        circle_id: &str,
        intersection_id: Option<&str>,
    ) -> Result<String, BoundaryError> {
        self(circle_id, intersection_id)
    }
}

/// Current state of an external resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveView {
    pub view_hash: String,
    pub tag: String,
}

/// Answers "what does the provider's resource look like right now?".
pub trait ViewVerifier: Send + Sync {
    fn live_view(&self, provider: &str, resource_id: &str) -> Result<LiveView, BoundaryError>;
}

impl<F> ViewVerifier for F
where
    F: Fn(&str, &str) -> Result<LiveView, BoundaryError> + Send + Sync,
{
    fn live_view(&self, provider: &str, resource_id: &str) -> Result<LiveView, BoundaryError> {
        self(provider, resource_id)
    }
}

/// Maximum age of a view snapshot, per provider, in whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    pub default_max_staleness_secs: i64,
    #[serde(default)]
    pub provider_overrides_secs: BTreeMap<String, i64>,
}

impl FreshnessPolicy {
    pub fn new(default_max_staleness: Duration) -> Self {
        Self {
            default_max_staleness_secs: default_max_staleness.num_seconds(),
            provider_overrides_secs: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, provider: impl Into<String>, max_staleness: Duration) -> Self {
        self.provider_overrides_secs
            .insert(provider.into(), max_staleness.num_seconds());
        self
    }

    /// Staleness bound that applies to `provider`. An unrepresentable limit
    /// collapses to zero.
    pub fn max_staleness_for(&self, provider: &str) -> Duration {
        let secs = self
            .provider_overrides_secs
            .get(provider)
            .copied()
            .unwrap_or(self.default_max_staleness_secs);
        Duration::try_seconds(secs.max(0)).unwrap_or_else(Duration::zero)
    }

    /// Every configured limit is non-negative and representable.
    pub fn is_valid(&self) -> bool {
        std::iter::once(&self.default_max_staleness_secs)
            .chain(self.provider_overrides_secs.values())
            .all(|secs| *secs >= 0 && Duration::try_seconds(*secs).is_some())
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_default() {
        let policy =
            FreshnessPolicy::new(Duration::minutes(5)).with_override("bank", Duration::minutes(1));
        assert_eq!(policy.max_staleness_for("bank"), Duration::minutes(1));
        assert_eq!(policy.max_staleness_for("calendar"), Duration::minutes(5));
    }

    #[test]
    fn closures_are_verifiers() {
        let policy = |circle: &str, _: Option<&str>| -> Result<String, BoundaryError> {
            Ok(format!("hash-{circle}"))
        };
        assert_eq!(policy.live_policy_hash("c1", None).unwrap(), "hash-c1");

        let view = |provider: &str, resource: &str| -> Result<LiveView, BoundaryError> {
            Ok(LiveView {
                view_hash: format!("{provider}:{resource}"),
                tag: "etag-1".to_string(),
            })
        };
        assert_eq!(view.live_view("cal", "evt").unwrap().view_hash, "cal:evt");
    }

    #[test]
    fn freshness_policy_loads_from_json() {
        let policy: FreshnessPolicy =
            serde_json::from_str(r#"{"default_max_staleness_secs": 600}"#).unwrap();
        assert_eq!(policy.max_staleness_for("any"), Duration::minutes(10));
    }

    #[test]
    fn sub_minute_limits_are_kept() {
        let policy = FreshnessPolicy::new(Duration::seconds(90))
            .with_override("bank", Duration::seconds(30));
        assert_eq!(policy.max_staleness_for("calendar"), Duration::seconds(90));
        assert_eq!(policy.max_staleness_for("bank"), Duration::seconds(30));
        assert!(policy.is_valid());
    }

    #[test]
    fn unrepresentable_limit_fails_closed() {
        let policy = FreshnessPolicy {
            default_max_staleness_secs: i64::MAX,
            provider_overrides_secs: BTreeMap::from([("bank".to_string(), -5)]),
        };
        assert!(!policy.is_valid());
        assert_eq!(policy.max_staleness_for("any"), Duration::zero());
        assert_eq!(policy.max_staleness_for("bank"), Duration::zero());
    }
}
