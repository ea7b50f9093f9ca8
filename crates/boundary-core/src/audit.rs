//! Append-only, hash-chained audit trail of every boundary transition.

use crate::error::BoundaryError;
use crate::settlement::SettlementStatus;
use crate::types::EnvelopeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

pub type AuditMetadata = BTreeMap<String, Value>;

/// Build metadata from key/value pairs.
pub fn metadata<const N: usize>(pairs: [(&str, Value); N]) -> AuditMetadata {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    IntentCreated,
    EnvelopeSealed,
    ApprovalRequested,
    ApprovalSubmitted,
    ApprovalVerified,
    RevocationRecorded,
    ExecutionStarted,
    ValidityChecked,
    ProviderInvoked,
    IdempotentReplay,
    SettlementSuccessful,
    SettlementBlocked,
    SettlementRevoked,
    SettlementExpired,
    SettlementAborted,
    AuditTraceFinalized,
}

impl AuditEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IntentCreated => "intent_created",
            Self::EnvelopeSealed => "envelope_sealed",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalSubmitted => "approval_submitted",
            Self::ApprovalVerified => "approval_verified",
            Self::RevocationRecorded => "revocation_recorded",
            Self::ExecutionStarted => "execution_started",
            Self::ValidityChecked => "validity_checked",
            Self::ProviderInvoked => "provider_invoked",
            Self::IdempotentReplay => "idempotent_replay",
            Self::SettlementSuccessful => "settlement_successful",
            Self::SettlementBlocked => "settlement_blocked",
            Self::SettlementRevoked => "settlement_revoked",
            Self::SettlementExpired => "settlement_expired",
            Self::SettlementAborted => "settlement_aborted",
            Self::AuditTraceFinalized => "audit_trace_finalized",
        }
    }

    pub fn settlement(status: SettlementStatus) -> Self {
        match status {
            SettlementStatus::Successful => Self::SettlementSuccessful,
            SettlementStatus::Blocked => Self::SettlementBlocked,
            SettlementStatus::Revoked => Self::SettlementRevoked,
            SettlementStatus::Expired => Self::SettlementExpired,
            SettlementStatus::Aborted => Self::SettlementAborted,
        }
    }

    pub fn is_settlement(self) -> bool {
        matches!(
            self,
            Self::SettlementSuccessful
                | Self::SettlementBlocked
                | Self::SettlementRevoked
                | Self::SettlementExpired
                | Self::SettlementAborted
        )
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hash-chained audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub sequence: u64,
    pub kind: AuditEventKind,
    pub envelope_id: Option<EnvelopeId>,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: AuditMetadata,
    pub previous_hash: Option<String>,
    pub event_hash: String,
}

impl AuditEvent {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }

    fn expected_hash(&self) -> String {
        compute_event_hash(
            self.sequence,
            &self.event_id,
            self.kind,
            self.envelope_id.as_ref(),
            &self.trace_id,
            self.timestamp,
            &self.metadata,
            self.previous_hash.as_deref(),
        )
    }
}

/// Durable home for audit events. Implementations only ever append.
pub trait AuditStore: Send + Sync {
    fn append(&self, event: AuditEvent) -> Result<(), BoundaryError>;

    fn list(&self) -> Result<Vec<AuditEvent>, BoundaryError>;

    fn last(&self) -> Result<Option<AuditEvent>, BoundaryError> {
        Ok(self.list()?.pop())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    events: RwLock<Vec<AuditEvent>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditStore for InMemoryAuditStore {
    fn append(&self, event: AuditEvent) -> Result<(), BoundaryError> {
        let mut events = self
            .events
            .write()
            .map_err(|_| BoundaryError::lock_poisoned("audit store"))?;

        let expected_sequence = events.len() as u64;
        if event.sequence != expected_sequence {
            return Err(BoundaryError::Audit(format!(
                "sequence mismatch: expected {}, got {}",
                expected_sequence, event.sequence
            )));
        }
        let expected_previous = events.last().map(|e| e.event_hash.clone());
        if event.previous_hash != expected_previous {
            return Err(BoundaryError::Audit("previous hash mismatch".to_string()));
        }
        if event.event_hash != event.expected_hash() {
            return Err(BoundaryError::Audit(format!(
                "hash mismatch for audit event {}",
                event.event_id
            )));
        }

        events.push(event);
        Ok(())
    }

    fn list(&self) -> Result<Vec<AuditEvent>, BoundaryError> {
        let events = self
            .events
            .read()
            .map_err(|_| BoundaryError::lock_poisoned("audit store"))?;
        Ok(events.clone())
    }

    fn last(&self) -> Result<Option<AuditEvent>, BoundaryError> {
        let events = self
            .events
            .read()
            .map_err(|_| BoundaryError::lock_poisoned("audit store"))?;
        Ok(events.last().cloned())
    }
}

/// Writes chained events into an [`AuditStore`].
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    append_lock: Mutex<()>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            append_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryAuditStore::new()))
    }

    pub fn record(
        &self,
        kind: AuditEventKind,
        envelope_id: Option<&EnvelopeId>,
        trace_id: &str,
        metadata: AuditMetadata,
        now: DateTime<Utc>,
    ) -> Result<AuditEvent, BoundaryError> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| BoundaryError::lock_poisoned("audit trail"))?;

        let last = self.store.last()?;
        let sequence = last.as_ref().map(|e| e.sequence + 1).unwrap_or(0);
        let previous_hash = last.map(|e| e.event_hash);
        let event_id = Uuid::new_v4().to_string();
        let event_hash = compute_event_hash(
            sequence,
            &event_id,
            kind,
            envelope_id,
            trace_id,
            now,
            &metadata,
            previous_hash.as_deref(),
        );

        let event = AuditEvent {
            event_id,
            sequence,
            kind,
            envelope_id: envelope_id.cloned(),
            trace_id: trace_id.to_string(),
            timestamp: now,
            metadata,
            previous_hash,
            event_hash,
        };
        self.store.append(event.clone())?;
        Ok(event)
    }

    pub fn events(&self) -> Result<Vec<AuditEvent>, BoundaryError> {
        self.store.list()
    }

    pub fn events_for(&self, envelope_id: &EnvelopeId) -> Result<Vec<AuditEvent>, BoundaryError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|e| e.envelope_id.as_ref() == Some(envelope_id))
            .collect())
    }

    pub fn verify_chain(&self) -> Result<bool, BoundaryError> {
        Ok(verify_chain(&self.store.list()?))
    }

    pub fn summary(&self, envelope_id: &EnvelopeId) -> Result<AuditSummary, BoundaryError> {
        Ok(AuditSummary::from_events(
            envelope_id,
            &self.events_for(envelope_id)?,
        ))
    }
}

/// Check sequence numbers, links and hashes of a full trail.
pub fn verify_chain(events: &[AuditEvent]) -> bool {
    let mut previous_hash: Option<String> = None;
    for (position, event) in events.iter().enumerate() {
        if event.sequence != position as u64 {
            return false;
        }
        if event.previous_hash != previous_hash {
            return false;
        }
        if event.event_hash != event.expected_hash() {
            return false;
        }
        previous_hash = Some(event.event_hash.clone());
    }
    true
}

/// History of one envelope, rebuilt from its audit events alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub envelope_id: EnvelopeId,
    pub trace_id: Option<String>,
    pub kinds: Vec<AuditEventKind>,
    pub approvals_requested: usize,
    pub approvals_submitted: usize,
    pub approvals_verified: usize,
    pub revoked: bool,
    pub execution_attempts: usize,
    pub provider_invocations: usize,
    pub idempotent_replays: usize,
    pub settlements: Vec<String>,
    pub final_settlement: Option<String>,
    pub effect_applied: bool,
}

impl AuditSummary {
    pub fn from_events(envelope_id: &EnvelopeId, events: &[AuditEvent]) -> Self {
        let mut summary = Self {
            envelope_id: envelope_id.clone(),
            trace_id: None,
            kinds: Vec::with_capacity(events.len()),
            approvals_requested: 0,
            approvals_submitted: 0,
            approvals_verified: 0,
            revoked: false,
            execution_attempts: 0,
            provider_invocations: 0,
            idempotent_replays: 0,
            settlements: Vec::new(),
            final_settlement: None,
            effect_applied: false,
        };

        for event in events
            .iter()
            .filter(|e| e.envelope_id.as_ref() == Some(envelope_id))
        {
            if summary.trace_id.is_none() {
                summary.trace_id = Some(event.trace_id.clone());
            }
            summary.kinds.push(event.kind);
            match event.kind {
                AuditEventKind::ApprovalRequested => summary.approvals_requested += 1,
                AuditEventKind::ApprovalSubmitted => summary.approvals_submitted += 1,
                AuditEventKind::ApprovalVerified => summary.approvals_verified += 1,
                AuditEventKind::RevocationRecorded => summary.revoked = true,
                AuditEventKind::ExecutionStarted => summary.execution_attempts += 1,
                AuditEventKind::ProviderInvoked => summary.provider_invocations += 1,
                AuditEventKind::IdempotentReplay => summary.idempotent_replays += 1,
                AuditEventKind::AuditTraceFinalized => {
                    summary.final_settlement = event.meta_str("status").map(str::to_string);
                    summary.effect_applied |= event.meta_bool("effect_applied").unwrap_or(false);
                }
                kind if kind.is_settlement() => {
                    if let Some(status) = event.meta_str("status") {
                        summary.settlements.push(status.to_string());
                    }
                }
                _ => {}
            }
        }

        summary
    }
}

#[allow(clippy::too_many_arguments)]
fn compute_event_hash(
    sequence: u64,
    event_id: &str,
    kind: AuditEventKind,
    envelope_id: Option<&EnvelopeId>,
    trace_id: &str,
    timestamp: DateTime<Utc>,
    metadata: &AuditMetadata,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "sequence": sequence,
        "event_id": event_id,
        "kind": kind,
        "envelope_id": envelope_id,
        "trace_id": trace_id,
        "timestamp": timestamp,
        "metadata": metadata,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
