use crate::envelope::Envelope;
use crate::error::BoundaryError;
use crate::language::LanguageChecker;
use crate::types::{ActionHash, ActionPayload, EnvelopeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Request for a human decision on one specific envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub envelope_id: EnvelopeId,
    pub circle_id: String,
    pub prompt_text: String,
    pub action_hash: ActionHash,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A submitted approval. Only ever valid against `action_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalArtifact {
    pub approval_id: String,
    pub request_id: String,
    pub circle_id: String,
    pub approver_id: String,
    pub action_hash: ActionHash,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ApprovalArtifact {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_bound_to(&self, action_hash: &ActionHash) -> bool {
        &self.action_hash == action_hash
    }
}

/// Issues approval requests and validates submitted approvals.
#[derive(Debug, Clone, Default)]
pub struct ApprovalManager {
    checker: LanguageChecker,
}

impl ApprovalManager {
    pub fn new(checker: LanguageChecker) -> Self {
        Self { checker }
    }

    pub fn checker(&self) -> &LanguageChecker {
        &self.checker
    }

    /// Create a request with a neutral prompt generated from the intent.
    pub fn create_approval_request(
        &self,
        envelope: &Envelope,
        circle_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, BoundaryError> {
        let prompt = neutral_prompt(envelope);
        self.create_approval_request_with_prompt(envelope, circle_id, prompt, expires_at, now)
    }

    /// Create a request with caller-supplied prompt text.
    ///
    /// Text containing any pressure language is refused outright.
    pub fn create_approval_request_with_prompt(
        &self,
        envelope: &Envelope,
        circle_id: &str,
        prompt_text: String,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest, BoundaryError> {
        if envelope.is_terminal() {
            return Err(BoundaryError::EnvelopeTerminal {
                envelope_id: envelope.envelope_id().to_string(),
                status: envelope.status().to_string(),
            });
        }
        if circle_id != envelope.circle_id() {
            return Err(BoundaryError::InvalidApproval(format!(
                "circle '{}' does not own envelope '{}'",
                circle_id, envelope.envelope_id()
            )));
        }
        if expires_at <= now {
            return Err(BoundaryError::InvalidApproval(
                "approval request expiry must be in the future".to_string(),
            ));
        }

        let violations = self.checker.check(&prompt_text);
        if !violations.is_empty() {
            return Err(BoundaryError::LanguageViolation(violations));
        }

        let request = ApprovalRequest {
            request_id: format!("apr-req-{}", Uuid::new_v4()),
            envelope_id: envelope.envelope_id().clone(),
            circle_id: circle_id.to_string(),
            prompt_text,
            action_hash: envelope.action_hash().clone(),
            expires_at: expires_at.min(envelope.expiry()),
            created_at: now,
        };

        debug!(
            request_id = %request.request_id,
            envelope_id = %request.envelope_id,
            "Approval request issued"
        );
        Ok(request)
    }

    /// Produce an approval artifact bound to the request's ActionHash.
    pub fn submit_approval(
        &self,
        request: &ApprovalRequest,
        circle_id: &str,
        approver_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalArtifact, BoundaryError> {
        if now > request.expires_at {
            return Err(BoundaryError::ApprovalRequestExpired {
                request_id: request.request_id.clone(),
                expired_at: request.expires_at.to_rfc3339(),
            });
        }
        if circle_id != request.circle_id {
            return Err(BoundaryError::InvalidApproval(format!(
                "circle '{}' cannot answer a request issued to '{}'",
                circle_id, request.circle_id
            )));
        }
        if approver_id.trim().is_empty() {
            return Err(BoundaryError::InvalidApproval(
                "approver identity is required".to_string(),
            ));
        }
        if expires_at <= now {
            return Err(BoundaryError::InvalidApproval(
                "approval expiry must be in the future".to_string(),
            ));
        }

        let artifact = ApprovalArtifact {
            approval_id: format!("apr-{}", Uuid::new_v4()),
            request_id: request.request_id.clone(),
            circle_id: circle_id.to_string(),
            approver_id: approver_id.to_string(),
            action_hash: request.action_hash.clone(),
            submitted_at: now,
            expires_at,
        };

        info!(
            approval_id = %artifact.approval_id,
            approver = %artifact.approver_id,
            envelope_id = %request.envelope_id,
            "Approval submitted"
        );
        Ok(artifact)
    }

    /// Check that an approval is usable against `target` at `now`.
    pub fn verify_approval(
        &self,
        approval: &ApprovalArtifact,
        target: &ActionHash,
        now: DateTime<Utc>,
    ) -> Result<(), BoundaryError> {
        if !approval.is_bound_to(target) {
            return Err(BoundaryError::ApprovalActionHashMismatch {
                expected: target.to_string(),
                actual: approval.action_hash.to_string(),
            });
        }
        if approval.is_expired_at(now) {
            return Err(BoundaryError::ApprovalExpired {
                approval_id: approval.approval_id.clone(),
                expired_at: approval.expires_at.to_rfc3339(),
            });
        }
        Ok(())
    }
}

fn neutral_prompt(envelope: &Envelope) -> String {
    let action = match &envelope.intent().payload {
        ActionPayload::EmailSend {
            recipient, subject, ..
        } => format!("send the email \"{subject}\" to {recipient}"),
        ActionPayload::CalendarRespond {
            calendar_id,
            event_id,
            response,
        } => format!(
            "send the response \"{}\" for event {event_id} on calendar {calendar_id}",
            response.as_str()
        ),
        ActionPayload::Payment {
            payee_id,
            amount,
            reference,
        } => format!("pay {amount} to {payee_id} with reference {reference}"),
        ActionPayload::Transfer {
            from_account,
            to_account,
            amount,
        } => format!("transfer {amount} from {from_account} to {to_account}"),
    };

    format!(
        "Approve or decline: {action} via {}. This request is valid until {}.",
        envelope.provider(),
        envelope.expiry().to_rfc3339()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeBuilder, SealingConfig};
    use crate::types::{Intent, Money};
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn envelope_for(intent_id: &str) -> Envelope {
        let intent = Intent::new(
            "circle-a",
            "mock_payments",
            ActionPayload::Payment {
                payee_id: "payee-1".to_string(),
                amount: Money::new(500, "EUR"),
                reference: "gym".to_string(),
            },
            "view-1",
            now(),
        )
        .with_id(intent_id);
        let config = SealingConfig::new(now() + Duration::hours(2))
            .with_policy_snapshot("policy-1")
            .with_view_snapshot("view-1", now());
        EnvelopeBuilder::new().seal(intent, config, now()).unwrap()
    }

    #[test]
    fn generated_prompt_is_neutral() {
        let manager = ApprovalManager::default();
        let envelope = envelope_for("intent-1");
        let request = manager
            .create_approval_request(&envelope, "circle-a", now() + Duration::hours(1), now())
            .unwrap();
        assert!(manager.checker().is_clean(&request.prompt_text));
        assert_eq!(&request.action_hash, envelope.action_hash());
        assert!(request.prompt_text.contains("payee-1"));
    }

    #[test]
    fn pressuring_prompt_is_refused() {
        let manager = ApprovalManager::default();
        let envelope = envelope_for("intent-1");
        let err = manager
            .create_approval_request_with_prompt(
                &envelope,
                "circle-a",
                "Pay immediately to avoid a problem".to_string(),
                now() + Duration::hours(1),
                now(),
            )
            .unwrap_err();
        match err {
            BoundaryError::LanguageViolation(violations) => assert_eq!(violations.len(), 2),
            other => panic!("expected language violation, got {other:?}"),
        }
    }

    #[test]
    fn request_expiry_is_clamped_to_envelope_expiry() {
        let manager = ApprovalManager::default();
        let envelope = envelope_for("intent-1");
        let request = manager
            .create_approval_request(&envelope, "circle-a", now() + Duration::days(3), now())
            .unwrap();
        assert_eq!(request.expires_at, envelope.expiry());
    }

    #[test]
    fn approval_for_one_envelope_fails_against_another() {
        let manager = ApprovalManager::default();
        let a = envelope_for("intent-a");
        let b = envelope_for("intent-b");
        let request = manager
            .create_approval_request(&a, "circle-a", now() + Duration::hours(1), now())
            .unwrap();
        let approval = manager
            .submit_approval(&request, "circle-a", "owner", now() + Duration::hours(1), now())
            .unwrap();

        manager
            .verify_approval(&approval, a.action_hash(), now())
            .unwrap();
        let err = manager
            .verify_approval(&approval, b.action_hash(), now())
            .unwrap_err();
        assert!(matches!(err, BoundaryError::ApprovalActionHashMismatch { .. }));
        assert!(err.to_string().contains("different ActionHash"));
    }

    #[test]
    fn expired_approval_fails_verification() {
        let manager = ApprovalManager::default();
        let envelope = envelope_for("intent-1");
        let request = manager
            .create_approval_request(&envelope, "circle-a", now() + Duration::hours(1), now())
            .unwrap();
        let approval = manager
            .submit_approval(&request, "circle-a", "owner", now() + Duration::minutes(10), now())
            .unwrap();

        let at_expiry = now() + Duration::minutes(10);
        assert!(manager
            .verify_approval(&approval, envelope.action_hash(), at_expiry)
            .is_ok());
        let err = manager
            .verify_approval(
                &approval,
                envelope.action_hash(),
                at_expiry + Duration::seconds(1),
            )
            .unwrap_err();
        assert!(matches!(err, BoundaryError::ApprovalExpired { .. }));
    }

    #[test]
    fn submit_rejects_wrong_circle_and_expired_request() {
        let manager = ApprovalManager::default();
        let envelope = envelope_for("intent-1");
        let request = manager
            .create_approval_request(&envelope, "circle-a", now() + Duration::minutes(5), now())
            .unwrap();

        assert!(matches!(
            manager.submit_approval(&request, "circle-z", "owner", now() + Duration::hours(1), now()),
            Err(BoundaryError::InvalidApproval(_))
        ));

        let late = now() + Duration::minutes(6);
        assert!(matches!(
            manager.submit_approval(&request, "circle-a", "owner", late + Duration::hours(1), late),
            Err(BoundaryError::ApprovalRequestExpired { .. })
        ));
    }

    #[test]
    fn request_for_foreign_circle_is_refused() {
        let manager = ApprovalManager::default();
        let envelope = envelope_for("intent-1");
        assert!(manager
            .create_approval_request(&envelope, "circle-b", now() + Duration::hours(1), now())
            .is_err());
    }
}
