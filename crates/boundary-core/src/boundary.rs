//! `ExecutionBoundary`: the single entry point hosts use to seal, approve,
//! revoke and execute intents.

use crate::approval::{ApprovalArtifact, ApprovalManager, ApprovalRequest};
use crate::audit::{
    metadata, AuditEvent, AuditEventKind, AuditStore, AuditSummary, AuditTrail,
    InMemoryAuditStore,
};
use crate::clock::{Clock, SystemClock};
use crate::config::BoundaryConfig;
use crate::envelope::{Envelope, EnvelopeBuilder, SealingConfig};
use crate::error::BoundaryError;
use crate::revocation::{RevocationRegistry, RevocationSignal};
use crate::runner::ExecutionRunner;
use crate::settlement::Settlement;
use crate::store::{EnvelopeStore, InMemoryEnvelopeStore};
use crate::types::{EnvelopeId, Intent};
use crate::validity::ValidityChecker;
use crate::verify::{PolicyVerifier, ViewVerifier};
use crate::writer::{ExecutionMode, Writer, WriterRegistry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Wires collaborators into an [`ExecutionBoundary`].
pub struct ExecutionBoundaryBuilder {
    config: BoundaryConfig,
    policy: Option<Arc<dyn PolicyVerifier>>,
    view: Option<Arc<dyn ViewVerifier>>,
    writers: Vec<Arc<dyn Writer>>,
    clock: Arc<dyn Clock>,
    envelopes: Arc<dyn EnvelopeStore>,
    audit: Arc<dyn AuditStore>,
    approvals: ApprovalManager,
}

impl ExecutionBoundaryBuilder {
    pub fn new(config: BoundaryConfig) -> Self {
        Self {
            config,
            policy: None,
            view: None,
            writers: Vec::new(),
            clock: Arc::new(SystemClock),
            envelopes: Arc::new(InMemoryEnvelopeStore::new()),
            audit: Arc::new(InMemoryAuditStore::new()),
            approvals: ApprovalManager::default(),
        }
    }

    pub fn policy_verifier(mut self, verifier: Arc<dyn PolicyVerifier>) -> Self {
        self.policy = Some(verifier);
        self
    }

    pub fn view_verifier(mut self, verifier: Arc<dyn ViewVerifier>) -> Self {
        self.view = Some(verifier);
        self
    }

    pub fn writer(mut self, writer: Arc<dyn Writer>) -> Self {
        self.writers.push(writer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn envelope_store(mut self, store: Arc<dyn EnvelopeStore>) -> Self {
        self.envelopes = store;
        self
    }

    pub fn audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit = store;
        self
    }

    pub fn approval_manager(mut self, approvals: ApprovalManager) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn build(self) -> Result<ExecutionBoundary, BoundaryError> {
        self.config.validate()?;
        let policy = self
            .policy
            .ok_or_else(|| BoundaryError::Config("policy verifier is required".to_string()))?;
        let view = self
            .view
            .ok_or_else(|| BoundaryError::Config("view verifier is required".to_string()))?;

        let mut writers = WriterRegistry::new(self.config.idempotency_cache_capacity);
        for writer in self.writers {
            writers.register(writer);
        }

        let revocations = Arc::new(RevocationRegistry::new());
        let audit = Arc::new(AuditTrail::new(self.audit));
        let validity = ValidityChecker::new(
            policy,
            view,
            self.config.freshness.clone(),
            revocations.clone(),
        );
        let runner = ExecutionRunner::new(
            writers,
            validity,
            self.config.execution_mode,
            audit.clone(),
        );

        info!(
            mode = %self.config.execution_mode,
            providers = ?runner.writers().providers(),
            "Execution boundary ready"
        );

        Ok(ExecutionBoundary {
            config: self.config,
            clock: self.clock,
            builder: EnvelopeBuilder::new(),
            approvals: self.approvals,
            revocations,
            envelopes: self.envelopes,
            envelope_locks: DashMap::new(),
            audit,
            runner,
        })
    }
}

/// Facade over the envelope lifecycle.
///
/// Every operation reads the clock once and records its transition in the
/// audit trail. Operations that rewrite a stored envelope hold that
/// envelope's lock from load to store.
pub struct ExecutionBoundary {
    config: BoundaryConfig,
    clock: Arc<dyn Clock>,
    builder: EnvelopeBuilder,
    approvals: ApprovalManager,
    revocations: Arc<RevocationRegistry>,
    envelopes: Arc<dyn EnvelopeStore>,
    envelope_locks: DashMap<EnvelopeId, Arc<Mutex<()>>>,
    audit: Arc<AuditTrail>,
    runner: ExecutionRunner,
}

impl ExecutionBoundary {
    pub fn builder(config: BoundaryConfig) -> ExecutionBoundaryBuilder {
        ExecutionBoundaryBuilder::new(config)
    }

    pub fn config(&self) -> &BoundaryConfig {
        &self.config
    }

    pub fn mode(&self) -> ExecutionMode {
        self.runner.mode()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Seal an intent and persist the envelope.
    pub fn seal(&self, intent: Intent, sealing: SealingConfig) -> Result<Envelope, BoundaryError> {
        let now = self.clock.now();
        let envelope = self.builder.seal(intent, sealing, now)?;

        self.audit.record(
            AuditEventKind::IntentCreated,
            Some(envelope.envelope_id()),
            envelope.trace_id(),
            metadata([
                ("intent_id", json!(envelope.intent().intent_id)),
                ("circle_id", json!(envelope.circle_id())),
                ("action_type", json!(envelope.action_type().as_str())),
            ]),
            now,
        )?;
        self.envelopes.put(envelope.clone())?;
        self.audit.record(
            AuditEventKind::EnvelopeSealed,
            Some(envelope.envelope_id()),
            envelope.trace_id(),
            metadata([
                ("action_hash", json!(envelope.action_hash().as_str())),
                ("provider", json!(envelope.provider())),
                ("approval_threshold", json!(envelope.approval_threshold())),
                ("expiry", json!(envelope.expiry().to_rfc3339())),
                ("idempotency_key", json!(envelope.idempotency_key())),
            ]),
            now,
        )?;
        Ok(envelope)
    }

    /// Issue an approval request with a generated neutral prompt.
    pub fn request_approval(
        &self,
        envelope_id: &EnvelopeId,
        circle_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<ApprovalRequest, BoundaryError> {
        let now = self.clock.now();
        let envelope = self.envelopes.require(envelope_id)?;
        let request =
            self.approvals
                .create_approval_request(&envelope, circle_id, expires_at, now)?;
        self.record_request(&envelope, &request, now)?;
        Ok(request)
    }

    /// Issue an approval request with caller-supplied prompt text.
    pub fn request_approval_with_prompt(
        &self,
        envelope_id: &EnvelopeId,
        circle_id: &str,
        prompt_text: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Result<ApprovalRequest, BoundaryError> {
        let now = self.clock.now();
        let envelope = self.envelopes.require(envelope_id)?;
        let request = self.approvals.create_approval_request_with_prompt(
            &envelope,
            circle_id,
            prompt_text.into(),
            expires_at,
            now,
        )?;
        self.record_request(&envelope, &request, now)?;
        Ok(request)
    }

    /// Submit an approval and attach it to the envelope it was requested for.
    ///
    /// The artifact is verified against that envelope's ActionHash before it
    /// is attached.
    pub fn submit_approval(
        &self,
        request: &ApprovalRequest,
        circle_id: &str,
        approver_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<ApprovalArtifact, BoundaryError> {
        let lock = self.envelope_lock(&request.envelope_id);
        let _guard = lock
            .lock()
            .map_err(|_| BoundaryError::lock_poisoned("envelope"))?;
        let now = self.clock.now();
        let mut envelope = self.envelopes.require(&request.envelope_id)?;
        let artifact =
            self.approvals
                .submit_approval(request, circle_id, approver_id, expires_at, now)?;
        self.attach(&mut envelope, artifact, now)
    }

    /// Attach an approval produced elsewhere. It must be bound to this
    /// envelope's ActionHash.
    pub fn attach_approval(
        &self,
        envelope_id: &EnvelopeId,
        artifact: ApprovalArtifact,
    ) -> Result<ApprovalArtifact, BoundaryError> {
        let lock = self.envelope_lock(envelope_id);
        let _guard = lock
            .lock()
            .map_err(|_| BoundaryError::lock_poisoned("envelope"))?;
        let now = self.clock.now();
        let mut envelope = self.envelopes.require(envelope_id)?;
        self.attach(&mut envelope, artifact, now)
    }

    /// Record a revocation. Permanent; later executions settle as revoked.
    ///
    /// Only the circle that owns the envelope may revoke it.
    pub fn revoke(
        &self,
        envelope_id: &EnvelopeId,
        circle_id: &str,
        actor_id: &str,
        reason: &str,
    ) -> Result<RevocationSignal, BoundaryError> {
        let now = self.clock.now();
        let envelope = self.envelopes.require(envelope_id)?;
        if circle_id != envelope.circle_id() {
            return Err(BoundaryError::InvalidRevocation(format!(
                "circle '{}' does not own envelope '{}'",
                circle_id, envelope_id
            )));
        }
        let signal = self
            .revocations
            .revoke(envelope_id, circle_id, actor_id, reason, now)?;
        self.audit.record(
            AuditEventKind::RevocationRecorded,
            Some(envelope_id),
            envelope.trace_id(),
            metadata([
                ("circle_id", json!(signal.circle_id)),
                ("actor_id", json!(signal.actor_id)),
                ("reason", json!(signal.reason)),
                ("revoked_at", json!(signal.revoked_at.to_rfc3339())),
            ]),
            now,
        )?;
        Ok(signal)
    }

    pub fn is_revoked(&self, envelope_id: &EnvelopeId) -> Result<bool, BoundaryError> {
        self.revocations.is_revoked(envelope_id)
    }

    /// Execute the envelope once. Blocking conditions come back as a
    /// settlement; only structural problems are errors.
    ///
    /// A concurrent call for the same envelope waits, then finds it settled.
    pub fn execute(&self, envelope_id: &EnvelopeId) -> Result<Settlement, BoundaryError> {
        let lock = self.envelope_lock(envelope_id);
        let _guard = lock
            .lock()
            .map_err(|_| BoundaryError::lock_poisoned("envelope"))?;
        let now = self.clock.now();
        let mut envelope = self.envelopes.require(envelope_id)?;
        let settlement = self.runner.execute(&mut envelope, now)?;
        self.envelopes.put(envelope)?;
        self.envelope_locks.remove(envelope_id);
        Ok(settlement)
    }

    pub fn envelope(&self, envelope_id: &EnvelopeId) -> Result<Envelope, BoundaryError> {
        self.envelopes.require(envelope_id)
    }

    pub fn audit_events(&self) -> Result<Vec<AuditEvent>, BoundaryError> {
        self.audit.events()
    }

    pub fn audit_events_for(
        &self,
        envelope_id: &EnvelopeId,
    ) -> Result<Vec<AuditEvent>, BoundaryError> {
        self.audit.events_for(envelope_id)
    }

    pub fn audit_summary(&self, envelope_id: &EnvelopeId) -> Result<AuditSummary, BoundaryError> {
        self.audit.summary(envelope_id)
    }

    pub fn verify_audit_chain(&self) -> Result<bool, BoundaryError> {
        self.audit.verify_chain()
    }

    fn envelope_lock(&self, envelope_id: &EnvelopeId) -> Arc<Mutex<()>> {
        self.envelope_locks
            .entry(envelope_id.clone())
            .or_default()
            .clone()
    }

    fn record_request(
        &self,
        envelope: &Envelope,
        request: &ApprovalRequest,
        now: DateTime<Utc>,
    ) -> Result<(), BoundaryError> {
        self.audit
            .record(
                AuditEventKind::ApprovalRequested,
                Some(envelope.envelope_id()),
                envelope.trace_id(),
                metadata([
                    ("request_id", json!(request.request_id)),
                    ("circle_id", json!(request.circle_id)),
                    ("expires_at", json!(request.expires_at.to_rfc3339())),
                ]),
                now,
            )
            .map(|_| ())
    }

    fn attach(
        &self,
        envelope: &mut Envelope,
        artifact: ApprovalArtifact,
        now: DateTime<Utc>,
    ) -> Result<ApprovalArtifact, BoundaryError> {
        self.approvals
            .verify_approval(&artifact, envelope.action_hash(), now)?;
        envelope.attach_approval(artifact.clone())?;

        self.audit.record(
            AuditEventKind::ApprovalSubmitted,
            Some(envelope.envelope_id()),
            envelope.trace_id(),
            metadata([
                ("approval_id", json!(artifact.approval_id)),
                ("approver_id", json!(artifact.approver_id)),
                ("action_hash", json!(artifact.action_hash.as_str())),
            ]),
            now,
        )?;
        self.envelopes.put(envelope.clone())?;

        self.audit.record(
            AuditEventKind::ApprovalVerified,
            Some(envelope.envelope_id()),
            envelope.trace_id(),
            metadata([
                ("approval_id", json!(artifact.approval_id)),
                ("approvals", json!(envelope.approvals().len())),
                ("threshold", json!(envelope.approval_threshold())),
            ]),
            now,
        )?;
        Ok(artifact)
    }
}
