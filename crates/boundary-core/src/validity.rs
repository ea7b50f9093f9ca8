use crate::envelope::{Envelope, EnvelopeStatus};
use crate::revocation::RevocationRegistry;
use crate::verify::{FreshnessPolicy, PolicyVerifier, ViewVerifier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Named preconditions evaluated at execution time.
///
/// Declaration order is the blocking priority: when several conditions fail,
/// the earliest one determines the settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionName {
    NoRevocationSignal,
    EnvelopeNotRevoked,
    EnvelopeNotExpired,
    SufficientApprovals,
    AmountWithinCap,
    RevocationWindowClosed,
    PolicyUnchanged,
    ViewFresh,
    ViewUnchanged,
}

impl ConditionName {
    pub const ALL: [ConditionName; 9] = [
        Self::NoRevocationSignal,
        Self::EnvelopeNotRevoked,
        Self::EnvelopeNotExpired,
        Self::SufficientApprovals,
        Self::AmountWithinCap,
        Self::RevocationWindowClosed,
        Self::PolicyUnchanged,
        Self::ViewFresh,
        Self::ViewUnchanged,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoRevocationSignal => "no_revocation_signal",
            Self::EnvelopeNotRevoked => "envelope_not_revoked",
            Self::EnvelopeNotExpired => "envelope_not_expired",
            Self::SufficientApprovals => "sufficient_approvals",
            Self::AmountWithinCap => "amount_within_cap",
            Self::RevocationWindowClosed => "revocation_window_closed",
            Self::PolicyUnchanged => "policy_unchanged",
            Self::ViewFresh => "view_fresh",
            Self::ViewUnchanged => "view_unchanged",
        }
    }
}

impl fmt::Display for ConditionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one named condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub name: ConditionName,
    pub passed: bool,
    pub detail: String,
}

impl Condition {
    fn pass(name: ConditionName, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: ConditionName, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }

    fn check(name: ConditionName, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed,
            detail: detail.into(),
        }
    }
}

/// Every condition, pass or fail, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityCheckResult {
    pub checked_at: DateTime<Utc>,
    pub conditions: Vec<Condition>,
}

impl ValidityCheckResult {
    pub fn all_passed(&self) -> bool {
        self.conditions.iter().all(|c| c.passed)
    }

    /// Highest-priority failing condition.
    pub fn first_failure(&self) -> Option<&Condition> {
        self.conditions
            .iter()
            .filter(|c| !c.passed)
            .min_by_key(|c| c.name)
    }

    pub fn condition(&self, name: ConditionName) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.name == name)
    }

    pub fn failed_names(&self) -> Vec<ConditionName> {
        self.conditions
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name)
            .collect()
    }
}

/// Evaluates the full condition set for an envelope at a given instant.
pub struct ValidityChecker {
    policy: Arc<dyn PolicyVerifier>,
    view: Arc<dyn ViewVerifier>,
    freshness: FreshnessPolicy,
    revocations: Arc<RevocationRegistry>,
}

impl ValidityChecker {
    pub fn new(
        policy: Arc<dyn PolicyVerifier>,
        view: Arc<dyn ViewVerifier>,
        freshness: FreshnessPolicy,
        revocations: Arc<RevocationRegistry>,
    ) -> Self {
        Self {
            policy,
            view,
            freshness,
            revocations,
        }
    }

    pub fn freshness(&self) -> &FreshnessPolicy {
        &self.freshness
    }

    pub fn check(&self, envelope: &Envelope, now: DateTime<Utc>) -> ValidityCheckResult {
        let conditions = vec![
            self.check_revocation_signal(envelope),
            check_status(envelope),
            check_expiry(envelope, now),
            check_approvals(envelope, now),
            check_amount(envelope),
            check_revocation_window(envelope, now),
            self.check_policy(envelope),
            self.check_staleness(envelope, now),
            self.check_view(envelope),
        ];

        for condition in &conditions {
            debug!(
                envelope_id = %envelope.envelope_id(),
                condition = condition.name.as_str(),
                passed = condition.passed,
                detail = %condition.detail,
                "Validity condition evaluated"
            );
        }

        ValidityCheckResult {
            checked_at: now,
            conditions,
        }
    }

    fn check_revocation_signal(&self, envelope: &Envelope) -> Condition {
        let name = ConditionName::NoRevocationSignal;
        match self.revocations.signal_for(envelope.envelope_id()) {
            Ok(None) => Condition::pass(name, "no revocation recorded"),
            Ok(Some(signal)) => Condition::fail(
                name,
                format!(
                    "revoked by {} at {}: {}",
                    signal.actor_id,
                    signal.revoked_at.to_rfc3339(),
                    signal.reason
                ),
            ),
            Err(err) => Condition::fail(name, format!("revocation registry unavailable: {err}")),
        }
    }

    fn check_policy(&self, envelope: &Envelope) -> Condition {
        let name = ConditionName::PolicyUnchanged;
        match self
            .policy
            .live_policy_hash(envelope.circle_id(), envelope.intersection_id())
        {
            Ok(live) if live == envelope.policy_snapshot_hash() => {
                Condition::pass(name, "live policy hash matches snapshot")
            }
            Ok(live) => Condition::fail(
                name,
                format!(
                    "policy mismatch: snapshot '{}' but live '{}'",
                    envelope.policy_snapshot_hash(), live
                ),
            ),
            Err(err) => Condition::fail(name, format!("policy verifier error: {err}")),
        }
    }

    fn check_staleness(&self, envelope: &Envelope, now: DateTime<Utc>) -> Condition {
        let max = self.freshness.max_staleness_for(envelope.provider());
        let age = now - envelope.view_snapshot_at();
        Condition::check(
            ConditionName::ViewFresh,
            age <= max,
            format!(
                "view staleness {}s against limit {}s",
                age.num_seconds(),
                max.num_seconds()
            ),
        )
    }

    fn check_view(&self, envelope: &Envelope) -> Condition {
        let name = ConditionName::ViewUnchanged;
        match self
            .view
            .live_view(envelope.provider(), &envelope.intent().resource_id())
        {
            Ok(live) if live.view_hash == envelope.view_snapshot_hash() => {
                Condition::pass(name, format!("live view matches snapshot (tag {})", live.tag))
            }
            Ok(live) => Condition::fail(
                name,
                format!(
                    "view changed: snapshot '{}' but live '{}' (tag {})",
                    envelope.view_snapshot_hash(), live.view_hash, live.tag
                ),
            ),
            Err(err) => Condition::fail(name, format!("view verifier error: {err}")),
        }
    }
}

fn check_status(envelope: &Envelope) -> Condition {
    Condition::check(
        ConditionName::EnvelopeNotRevoked,
        envelope.status() != EnvelopeStatus::Revoked,
        format!("envelope status {}", envelope.status()),
    )
}

fn check_expiry(envelope: &Envelope, now: DateTime<Utc>) -> Condition {
    Condition::check(
        ConditionName::EnvelopeNotExpired,
        now <= envelope.expiry(),
        format!("expiry {}", envelope.expiry().to_rfc3339()),
    )
}

fn check_approvals(envelope: &Envelope, now: DateTime<Utc>) -> Condition {
    let approvers: BTreeSet<&str> = envelope
        .approvals()
        .iter()
        .filter(|a| a.is_bound_to(envelope.action_hash()) && !a.is_expired_at(now))
        .map(|a| a.approver_id.as_str())
        .collect();
    let valid = approvers.len() as u32;

    Condition::check(
        ConditionName::SufficientApprovals,
        valid >= envelope.approval_threshold(),
        format!(
            "{} of {} required approvals valid ({} submitted)",
            valid,
            envelope.approval_threshold(),
            envelope.approvals().len()
        ),
    )
}

fn check_amount(envelope: &Envelope) -> Condition {
    let name = ConditionName::AmountWithinCap;
    let Some(requested) = envelope.requested_amount() else {
        return Condition::pass(name, "no monetary amount requested");
    };
    let Some(cap) = envelope.caps().amount_cap.as_ref() else {
        return Condition::fail(name, format!("no amount cap sealed for {requested}"));
    };
    if requested.currency != cap.currency {
        return Condition::fail(
            name,
            format!("currency {} does not match cap {}", requested.currency, cap),
        );
    }
    Condition::check(
        name,
        requested.amount_minor <= cap.amount_minor,
        format!("requested {requested} against cap {cap}"),
    )
}

fn check_revocation_window(envelope: &Envelope, now: DateTime<Utc>) -> Condition {
    let name = ConditionName::RevocationWindowClosed;
    match envelope.revocation_window_closes_at() {
        Some(closes_at) => Condition::check(
            name,
            now >= closes_at,
            format!("revocation window closes at {}", closes_at.to_rfc3339()),
        ),
        None => Condition::fail(
            name,
            format!(
                "revocation window of {}s never closes",
                envelope.revocation_window().num_seconds()
            ),
        ),
    }
}
