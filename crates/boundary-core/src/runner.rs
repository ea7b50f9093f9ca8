use crate::audit::{metadata, AuditEventKind, AuditMetadata, AuditTrail};
use crate::envelope::Envelope;
use crate::error::BoundaryError;
use crate::settlement::{Settlement, SettlementStatus};
use crate::validity::{ValidityCheckResult, ValidityChecker};
use crate::writer::{ActionRequest, ExecutionMode, WriterRegistry};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Drives a single execution attempt: validity check, at most one provider
/// effect, terminal status, audit.
pub struct ExecutionRunner {
    writers: WriterRegistry,
    validity: ValidityChecker,
    mode: ExecutionMode,
    audit: Arc<AuditTrail>,
}

impl ExecutionRunner {
    pub fn new(
        writers: WriterRegistry,
        validity: ValidityChecker,
        mode: ExecutionMode,
        audit: Arc<AuditTrail>,
    ) -> Self {
        Self {
            writers,
            validity,
            mode,
            audit,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn writers(&self) -> &WriterRegistry {
        &self.writers
    }

    /// Execute `envelope` at `now` and record its terminal status on it.
    ///
    /// Terminal envelopes and unknown providers are refused before anything is
    /// audited. Past that point exactly one `ExecutionStarted` event is
    /// written and the call never retries.
    pub fn execute(
        &self,
        envelope: &mut Envelope,
        now: DateTime<Utc>,
    ) -> Result<Settlement, BoundaryError> {
        if envelope.is_terminal() {
            return Err(BoundaryError::EnvelopeTerminal {
                envelope_id: envelope.envelope_id().to_string(),
                status: envelope.status().to_string(),
            });
        }
        if !self.writers.has(envelope.provider()) {
            return Err(BoundaryError::UnknownProvider(envelope.provider().to_string()));
        }

        self.record(
            envelope,
            AuditEventKind::ExecutionStarted,
            metadata([
                ("provider", json!(envelope.provider())),
                ("mode", json!(self.mode.as_str())),
                ("idempotency_key", json!(envelope.idempotency_key())),
            ]),
            now,
        )?;

        let validity = self.validity.check(envelope, now);
        let failed: Vec<&str> = validity
            .failed_names()
            .into_iter()
            .map(|name| name.as_str())
            .collect();
        self.record(
            envelope,
            AuditEventKind::ValidityChecked,
            metadata([
                ("passed", json!(validity.all_passed())),
                ("failed_conditions", json!(failed)),
            ]),
            now,
        )?;

        let settlement = match Settlement::from_failed_validity(envelope, validity.clone(), now) {
            Some(blocked) => blocked,
            None => self.perform(envelope, validity, now)?,
        };

        self.finish(envelope, &settlement, now)?;
        Ok(settlement)
    }

    fn perform(
        &self,
        envelope: &Envelope,
        validity: ValidityCheckResult,
        now: DateTime<Utc>,
    ) -> Result<Settlement, BoundaryError> {
        let Some(permit) = self.mode.live_permit() else {
            return Ok(Settlement::aborted(envelope, validity, now));
        };

        let request = ActionRequest::from_envelope(envelope);
        match self.writers.invoke(&permit, &request) {
            Ok(invocation) => {
                let kind = if invocation.replayed() {
                    AuditEventKind::IdempotentReplay
                } else {
                    AuditEventKind::ProviderInvoked
                };
                let receipt = invocation.receipt();
                self.record(
                    envelope,
                    kind,
                    metadata([
                        ("provider", json!(invocation.provider())),
                        ("success", json!(receipt.success)),
                        ("provider_response_id", json!(receipt.provider_response_id)),
                        ("idempotency_key", json!(receipt.idempotency_key)),
                    ]),
                    now,
                )?;
                Ok(Settlement::from_invocation(envelope, validity, &invocation, now))
            }
            Err(BoundaryError::ProviderFailure { provider, message }) => {
                self.record(
                    envelope,
                    AuditEventKind::ProviderInvoked,
                    metadata([
                        ("provider", json!(provider)),
                        ("success", json!(false)),
                        ("error", json!(message)),
                    ]),
                    now,
                )?;
                Ok(Settlement::provider_failed(envelope, validity, message, now))
            }
            Err(err) => Err(err),
        }
    }

    fn finish(
        &self,
        envelope: &mut Envelope,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> Result<(), BoundaryError> {
        envelope.record_terminal(settlement.status().envelope_status())?;

        self.record(
            envelope,
            AuditEventKind::settlement(settlement.status()),
            metadata([
                ("status", json!(settlement.status().as_str())),
                (
                    "failed_condition",
                    json!(settlement.failed_condition().map(|c| c.as_str())),
                ),
                ("blocked_reason", json!(settlement.blocked_reason())),
                ("rejection_reason", json!(settlement.rejection_reason())),
                ("provider_response_id", json!(settlement.provider_response_id())),
                ("replayed", json!(settlement.replayed())),
            ]),
            now,
        )?;
        self.record(
            envelope,
            AuditEventKind::AuditTraceFinalized,
            metadata([
                ("status", json!(settlement.status().as_str())),
                ("effect_applied", json!(settlement.effect_applied())),
            ]),
            now,
        )?;

        match settlement.status() {
            SettlementStatus::Successful => info!(
                envelope_id = %envelope.envelope_id(),
                provider = %envelope.provider(),
                provider_response_id = settlement.provider_response_id().unwrap_or_default(),
                replayed = settlement.replayed(),
                "Envelope executed"
            ),
            status => warn!(
                envelope_id = %envelope.envelope_id(),
                provider = %envelope.provider(),
                status = status.as_str(),
                reason = settlement.blocked_reason().unwrap_or_default(),
                "Envelope not executed"
            ),
        }
        Ok(())
    }

    fn record(
        &self,
        envelope: &Envelope,
        kind: AuditEventKind,
        meta: AuditMetadata,
        now: DateTime<Utc>,
    ) -> Result<(), BoundaryError> {
        self.audit
            .record(kind, Some(envelope.envelope_id()), envelope.trace_id(), meta, now)
            .map(|_| ())
    }
}
