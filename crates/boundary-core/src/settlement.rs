use crate::envelope::{Envelope, EnvelopeStatus};
use crate::types::EnvelopeId;
use crate::validity::{Condition, ConditionName, ValidityCheckResult};
use crate::writer::ProviderInvocation;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Terminal outcome of an execution attempt. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Successful,
    Blocked,
    Revoked,
    Expired,
    Aborted,
}

impl SettlementStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Successful => "successful",
            Self::Blocked => "blocked",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
            Self::Aborted => "aborted",
        }
    }

    pub fn envelope_status(self) -> EnvelopeStatus {
        match self {
            Self::Successful => EnvelopeStatus::Executed,
            Self::Blocked => EnvelopeStatus::Blocked,
            Self::Revoked => EnvelopeStatus::Revoked,
            Self::Expired => EnvelopeStatus::Expired,
            Self::Aborted => EnvelopeStatus::Aborted,
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of `execute`.
///
/// Fields are read-only. Settlements are constructed inside the crate only,
/// and `Successful` requires a [`ProviderInvocation`], which in turn requires
/// a live-mode permit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settlement {
    envelope_id: EnvelopeId,
    status: SettlementStatus,
    failed_condition: Option<ConditionName>,
    blocked_reason: Option<String>,
    rejection_reason: Option<String>,
    provider_response_id: Option<String>,
    updated_tag: Option<String>,
    idempotency_key: String,
    settled_at: DateTime<Utc>,
    replayed: bool,
    validity: ValidityCheckResult,
}

impl Settlement {
    fn base(
        envelope: &Envelope,
        status: SettlementStatus,
        validity: ValidityCheckResult,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            envelope_id: envelope.envelope_id().clone(),
            status,
            failed_condition: None,
            blocked_reason: None,
            rejection_reason: None,
            provider_response_id: None,
            updated_tag: None,
            idempotency_key: envelope.idempotency_key().to_string(),
            settled_at: now,
            replayed: false,
            validity,
        }
    }

    /// Outcome for a failed validity check. `None` when every condition passed.
    pub(crate) fn from_failed_validity(
        envelope: &Envelope,
        validity: ValidityCheckResult,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let failure = validity.first_failure()?.clone();
        let status = match failure.name {
            ConditionName::NoRevocationSignal | ConditionName::EnvelopeNotRevoked => {
                SettlementStatus::Revoked
            }
            ConditionName::EnvelopeNotExpired => SettlementStatus::Expired,
            _ => SettlementStatus::Blocked,
        };
        let mut settlement = Self::base(envelope, status, validity, now);
        settlement.failed_condition = Some(failure.name);
        settlement.blocked_reason = Some(blocked_reason(&failure));
        Some(settlement)
    }

    /// Dry-run outcome for an envelope that would otherwise have executed.
    pub(crate) fn aborted(
        envelope: &Envelope,
        validity: ValidityCheckResult,
        now: DateTime<Utc>,
    ) -> Self {
        let mut settlement = Self::base(envelope, SettlementStatus::Aborted, validity, now);
        settlement.blocked_reason =
            Some("dry-run execution mode: provider not invoked".to_string());
        settlement
    }

    /// Outcome when the writer returned an error.
    pub(crate) fn provider_failed(
        envelope: &Envelope,
        validity: ValidityCheckResult,
        message: String,
        now: DateTime<Utc>,
    ) -> Self {
        let mut settlement = Self::base(envelope, SettlementStatus::Blocked, validity, now);
        settlement.blocked_reason = Some("provider error".to_string());
        settlement.rejection_reason = Some(message);
        settlement
    }

    /// Map a provider receipt. A receipt with `success == false` is a rejection.
    pub(crate) fn from_invocation(
        envelope: &Envelope,
        validity: ValidityCheckResult,
        invocation: &ProviderInvocation,
        now: DateTime<Utc>,
    ) -> Self {
        let receipt = invocation.receipt();
        let status = if receipt.success {
            SettlementStatus::Successful
        } else {
            SettlementStatus::Blocked
        };

        let mut settlement = Self::base(envelope, status, validity, now);
        settlement.provider_response_id = Some(receipt.provider_response_id.clone());
        settlement.updated_tag = receipt.updated_tag.clone();
        settlement.replayed = invocation.replayed();
        if !receipt.success {
            settlement.blocked_reason = Some("provider rejected".to_string());
            settlement.rejection_reason = Some(
                receipt
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("rejected by {}", invocation.provider())),
            );
        }
        settlement
    }

    pub fn envelope_id(&self) -> &EnvelopeId {
        &self.envelope_id
    }

    pub fn status(&self) -> SettlementStatus {
        self.status
    }

    pub fn failed_condition(&self) -> Option<ConditionName> {
        self.failed_condition
    }

    pub fn blocked_reason(&self) -> Option<&str> {
        self.blocked_reason.as_deref()
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn provider_response_id(&self) -> Option<&str> {
        self.provider_response_id.as_deref()
    }

    pub fn updated_tag(&self) -> Option<&str> {
        self.updated_tag.as_deref()
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn settled_at(&self) -> DateTime<Utc> {
        self.settled_at
    }

    pub fn replayed(&self) -> bool {
        self.replayed
    }

    pub fn validity(&self) -> &ValidityCheckResult {
        &self.validity
    }

    pub fn effect_applied(&self) -> bool {
        self.status == SettlementStatus::Successful
    }
}

fn blocked_reason(failure: &Condition) -> String {
    let prefix = match failure.name {
        ConditionName::NoRevocationSignal | ConditionName::EnvelopeNotRevoked => "revoked",
        ConditionName::EnvelopeNotExpired => "envelope expired",
        ConditionName::SufficientApprovals => "insufficient approvals",
        ConditionName::AmountWithinCap => "amount cap exceeded",
        ConditionName::RevocationWindowClosed => "revocation window still open",
        ConditionName::PolicyUnchanged => "policy changed since sealing",
        ConditionName::ViewFresh => "view snapshot is stale",
        ConditionName::ViewUnchanged => "view changed since sealing",
    };
    format!("{prefix}: {}", failure.detail)
}
