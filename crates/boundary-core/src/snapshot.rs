use crate::hashing::{canonical_time, digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const POLICY_DOMAIN: &str = "boundary.policy.v1";
const VIEW_DOMAIN: &str = "boundary.view.v1";

/// Point-in-time capture of the circle's execution policy.
///
/// `captured_at` is excluded from the hash: a live recomputation over the same
/// policy must produce the same PolicyHash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub circle_id: String,
    pub intersection_id: Option<String>,
    pub owner_scope: bool,
    pub provider_scope: bool,
    pub allowed_providers: BTreeSet<String>,
    pub require_explicit_approval: bool,
    pub max_staleness_minutes: i64,
    pub captured_at: DateTime<Utc>,
}

impl PolicySnapshot {
    pub fn policy_hash(&self) -> String {
        let material = serde_json::json!({
            "circle_id": self.circle_id,
            "intersection_id": self.intersection_id,
            "owner_scope": self.owner_scope,
            "provider_scope": self.provider_scope,
            "allowed_providers": self.allowed_providers,
            "require_explicit_approval": self.require_explicit_approval,
            "max_staleness_minutes": self.max_staleness_minutes,
        });
        digest(POLICY_DOMAIN, &material)
    }

    pub fn allows_provider(&self, provider: &str) -> bool {
        self.allowed_providers.contains(provider)
    }
}

/// Point-in-time capture of the external resource the intent acts upon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSnapshot {
    pub provider: String,
    pub resource_id: String,
    /// External entity tag (ETag or equivalent version marker).
    pub etag: String,
    pub last_updated: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
}

impl ViewSnapshot {
    pub fn view_hash(&self) -> String {
        let material = serde_json::json!({
            "provider": self.provider,
            "resource_id": self.resource_id,
            "etag": self.etag,
            "last_updated": canonical_time(self.last_updated),
        });
        digest(VIEW_DOMAIN, &material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn policy(captured_at: DateTime<Utc>) -> PolicySnapshot {
        PolicySnapshot {
            circle_id: "circle-a".to_string(),
            intersection_id: None,
            owner_scope: true,
            provider_scope: true,
            allowed_providers: ["mock_payments".to_string()].into_iter().collect(),
            require_explicit_approval: true,
            max_staleness_minutes: 5,
            captured_at,
        }
    }

    #[test]
    fn policy_hash_ignores_capture_time() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let a = policy(t0);
        let b = policy(t0 + Duration::hours(3));
        assert_eq!(a.policy_hash(), b.policy_hash());
    }

    #[test]
    fn policy_hash_tracks_policy_changes() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let a = policy(t0);
        let mut b = policy(t0);
        b.require_explicit_approval = false;
        assert_ne!(a.policy_hash(), b.policy_hash());
        assert!(a.allows_provider("mock_payments"));
        assert!(!a.allows_provider("other"));
    }

    #[test]
    fn view_hash_tracks_etag() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let a = ViewSnapshot {
            provider: "calendar".to_string(),
            resource_id: "primary/evt-1".to_string(),
            etag: "\"v1\"".to_string(),
            last_updated: t0,
            captured_at: t0,
        };
        let mut b = a.clone();
        b.captured_at = t0 + Duration::minutes(1);
        assert_eq!(a.view_hash(), b.view_hash());

        b.etag = "\"v2\"".to_string();
        assert_ne!(a.view_hash(), b.view_hash());
    }
}
