//! Reference collaborators for the Execution Boundary.
//!
//! Writers here never leave the process: they record what they were asked to
//! do so hosts and tests can observe every effect.

#![deny(unsafe_code)]

use boundary_core::error::BoundaryError;
use boundary_core::snapshot::{PolicySnapshot, ViewSnapshot};
use boundary_core::types::{ActionPayload, AttendeeResponse, Money};
use boundary_core::verify::{LiveView, PolicyVerifier, ViewVerifier};
use boundary_core::writer::{ActionRequest, Receipt, Writer};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Sandbox calendar that records attendee responses in memory.
#[derive(Debug)]
pub struct SandboxCalendarWriter {
    provider_id: String,
    invocations: AtomicUsize,
    responses: Mutex<BTreeMap<String, (AttendeeResponse, String)>>,
}

impl SandboxCalendarWriter {
    pub const PROVIDER: &'static str = "sandbox_calendar";

    pub fn new() -> Self {
        Self::with_provider_id(Self::PROVIDER)
    }

    pub fn with_provider_id(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            invocations: AtomicUsize::new(0),
            responses: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Recorded response and etag for `calendar_id/event_id`.
    pub fn response_for(&self, resource_id: &str) -> Option<(AttendeeResponse, String)> {
        self.responses
            .lock()
            .ok()
            .and_then(|responses| responses.get(resource_id).cloned())
    }
}

impl Default for SandboxCalendarWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer for SandboxCalendarWriter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn is_sandbox(&self) -> bool {
        true
    }

    fn perform(&self, request: &ActionRequest) -> Result<Receipt, BoundaryError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let ActionPayload::CalendarRespond { response, .. } = &request.payload else {
            return Ok(rejected(
                request,
                "calendar",
                format!(
                    "{} cannot perform {}",
                    self.provider_id,
                    request.payload.action_type()
                ),
            ));
        };

        let etag = blake3::hash(
            format!(
                "{}|{}|{}",
                request.resource_id,
                response.as_str(),
                request.idempotency_key
            )
            .as_bytes(),
        )
        .to_hex()
        .to_string();

        let mut responses = self
            .responses
            .lock()
            .map_err(|_| BoundaryError::lock_poisoned("sandbox calendar"))?;
        responses.insert(request.resource_id.clone(), (*response, etag.clone()));

        debug!(
            resource_id = %request.resource_id,
            response = response.as_str(),
            "Sandbox calendar response recorded"
        );
        Ok(Receipt {
            success: true,
            updated_tag: Some(etag),
            provider_response_id: format!("cal-{}", Uuid::new_v4()),
            idempotency_key: request.idempotency_key.clone(),
            message: None,
        })
    }
}

/// A payment accepted by [`MockPaymentWriter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPayment {
    pub provider_response_id: String,
    pub payee: String,
    pub amount: Money,
    pub idempotency_key: String,
}

/// Mock payment rail. Accepts payments and transfers up to an optional limit.
#[derive(Debug)]
pub struct MockPaymentWriter {
    provider_id: String,
    limit: Option<Money>,
    invocations: AtomicUsize,
    payments: Mutex<Vec<RecordedPayment>>,
}

impl MockPaymentWriter {
    pub const PROVIDER: &'static str = "mock_payments";

    pub fn new() -> Self {
        Self {
            provider_id: Self::PROVIDER.to_string(),
            limit: None,
            invocations: AtomicUsize::new(0),
            payments: Mutex::new(Vec::new()),
        }
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    /// Reject any single payment above `limit`.
    pub fn with_limit(mut self, limit: Money) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn payments(&self) -> Vec<RecordedPayment> {
        self.payments
            .lock()
            .map(|payments| payments.clone())
            .unwrap_or_default()
    }
}

impl Default for MockPaymentWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer for MockPaymentWriter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn is_sandbox(&self) -> bool {
        true
    }

    fn perform(&self, request: &ActionRequest) -> Result<Receipt, BoundaryError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let (payee, amount) = match &request.payload {
            ActionPayload::Payment {
                payee_id, amount, ..
            } => (payee_id.clone(), amount.clone()),
            ActionPayload::Transfer {
                to_account, amount, ..
            } => (to_account.clone(), amount.clone()),
            other => {
                return Ok(rejected(
                    request,
                    "pay",
                    format!("{} cannot perform {}", self.provider_id, other.action_type()),
                ))
            }
        };

        if let Some(limit) = &self.limit {
            if amount.currency != limit.currency || amount.amount_minor > limit.amount_minor {
                return Ok(rejected(
                    request,
                    "pay",
                    format!("{amount} exceeds rail limit {limit}"),
                ));
            }
        }

        let record = RecordedPayment {
            provider_response_id: format!("pay-{}", Uuid::new_v4()),
            payee,
            amount,
            idempotency_key: request.idempotency_key.clone(),
        };
        let mut payments = self
            .payments
            .lock()
            .map_err(|_| BoundaryError::lock_poisoned("mock payments"))?;
        payments.push(record.clone());

        Ok(Receipt {
            success: true,
            updated_tag: None,
            provider_response_id: record.provider_response_id,
            idempotency_key: request.idempotency_key.clone(),
            message: None,
        })
    }
}

/// Writer whose provider always declines.
#[derive(Debug)]
pub struct AlwaysRejectWriter {
    provider_id: String,
    reason: String,
    invocations: AtomicUsize,
}

impl AlwaysRejectWriter {
    pub fn new(provider_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            reason: reason.into(),
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Writer for AlwaysRejectWriter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn is_sandbox(&self) -> bool {
        true
    }

    fn perform(&self, request: &ActionRequest) -> Result<Receipt, BoundaryError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(rejected(request, "rej", self.reason.clone()))
    }
}

/// Writer whose transport always errors.
#[derive(Debug)]
pub struct AlwaysFailWriter {
    provider_id: String,
    reason: String,
    invocations: AtomicUsize,
}

impl AlwaysFailWriter {
    pub fn new(provider_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            reason: reason.into(),
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Writer for AlwaysFailWriter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn is_sandbox(&self) -> bool {
        true
    }

    fn perform(&self, _request: &ActionRequest) -> Result<Receipt, BoundaryError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Err(BoundaryError::ProviderFailure {
            provider: self.provider_id.clone(),
            message: self.reason.clone(),
        })
    }
}

fn rejected(request: &ActionRequest, prefix: &str, reason: String) -> Receipt {
    Receipt {
        success: false,
        updated_tag: None,
        provider_response_id: format!("{prefix}-{}", Uuid::new_v4()),
        idempotency_key: request.idempotency_key.clone(),
        message: Some(reason),
    }
}

/// Policy hashes held in memory, keyed by circle and optional intersection.
#[derive(Debug, Default)]
pub struct StaticPolicyVerifier {
    hashes: RwLock<HashMap<(String, Option<String>), String>>,
}

impl StaticPolicyVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, circle_id: &str, policy_hash: impl Into<String>) -> Self {
        self.hashes
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((circle_id.to_string(), None), policy_hash.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: &PolicySnapshot) -> Self {
        self.hashes
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (snapshot.circle_id.clone(), snapshot.intersection_id.clone()),
                snapshot.policy_hash(),
            );
        self
    }

    /// Replace the live hash, as a policy edit would.
    pub fn set(
        &self,
        circle_id: &str,
        intersection_id: Option<&str>,
        policy_hash: impl Into<String>,
    ) -> Result<(), BoundaryError> {
        self.hashes
            .write()
            .map_err(|_| BoundaryError::lock_poisoned("policy verifier"))?
            .insert(
                (circle_id.to_string(), intersection_id.map(str::to_string)),
                policy_hash.into(),
            );
        Ok(())
    }
}

impl PolicyVerifier for StaticPolicyVerifier {
    fn live_policy_hash(
        &self,
        circle_id: &str,
        intersection_id: Option<&str>,
    ) -> Result<String, BoundaryError> {
        let hashes = self
            .hashes
            .read()
            .map_err(|_| BoundaryError::lock_poisoned("policy verifier"))?;
        hashes
            .get(&(circle_id.to_string(), intersection_id.map(str::to_string)))
            .or_else(|| hashes.get(&(circle_id.to_string(), None)))
            .cloned()
            .ok_or_else(|| BoundaryError::Verifier(format!("no policy for circle '{circle_id}'")))
    }
}

/// Live views held in memory, keyed by provider and resource.
#[derive(Debug, Default)]
pub struct StaticViewVerifier {
    views: RwLock<HashMap<(String, String), LiveView>>,
}

impl StaticViewVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_view(
        mut self,
        provider: &str,
        resource_id: &str,
        view_hash: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        self.views
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (provider.to_string(), resource_id.to_string()),
                LiveView {
                    view_hash: view_hash.into(),
                    tag: tag.into(),
                },
            );
        self
    }

    pub fn with_snapshot(self, snapshot: &ViewSnapshot) -> Self {
        self.with_view(
            &snapshot.provider,
            &snapshot.resource_id,
            snapshot.view_hash(),
            snapshot.etag.clone(),
        )
    }

    pub fn set(
        &self,
        provider: &str,
        resource_id: &str,
        view_hash: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<(), BoundaryError> {
        self.views
            .write()
            .map_err(|_| BoundaryError::lock_poisoned("view verifier"))?
            .insert(
                (provider.to_string(), resource_id.to_string()),
                LiveView {
                    view_hash: view_hash.into(),
                    tag: tag.into(),
                },
            );
        Ok(())
    }

    /// Record the resource as it looks in `snapshot`.
    pub fn set_snapshot(&self, snapshot: &ViewSnapshot) -> Result<(), BoundaryError> {
        self.set(
            &snapshot.provider,
            &snapshot.resource_id,
            snapshot.view_hash(),
            snapshot.etag.clone(),
        )
    }

    /// Simulate an external edit: new etag, new last-updated time.
    pub fn touch(
        &self,
        snapshot: &ViewSnapshot,
        etag: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), BoundaryError> {
        let edited = ViewSnapshot {
            etag: etag.to_string(),
            last_updated: updated_at,
            ..snapshot.clone()
        };
        self.set_snapshot(&edited)
    }
}

impl ViewVerifier for StaticViewVerifier {
    fn live_view(&self, provider: &str, resource_id: &str) -> Result<LiveView, BoundaryError> {
        let views = self
            .views
            .read()
            .map_err(|_| BoundaryError::lock_poisoned("view verifier"))?;
        views
            .get(&(provider.to_string(), resource_id.to_string()))
            .cloned()
            .ok_or_else(|| {
                BoundaryError::Verifier(format!("no view for {provider}/{resource_id}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boundary_core::types::{ActionHash, EnvelopeId};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn request(payload: ActionPayload, key: &str) -> ActionRequest {
        ActionRequest {
            envelope_id: EnvelopeId::from("env-1"),
            trace_id: "trace-1".to_string(),
            circle_id: "circle-a".to_string(),
            provider: "any".to_string(),
            resource_id: payload.resource_id(),
            action_hash: ActionHash("hash".to_string()),
            idempotency_key: key.to_string(),
            payload,
        }
    }

    fn calendar_payload() -> ActionPayload {
        ActionPayload::CalendarRespond {
            calendar_id: "cal-1".to_string(),
            event_id: "evt-1".to_string(),
            response: AttendeeResponse::Tentative,
        }
    }

    fn payment_payload(amount_minor: u64) -> ActionPayload {
        ActionPayload::Payment {
            payee_id: "payee-1".to_string(),
            amount: Money::new(amount_minor, "USD"),
            reference: "ref".to_string(),
        }
    }

    #[test]
    fn calendar_records_response_and_etag() {
        let writer = SandboxCalendarWriter::new();
        let receipt = writer.perform(&request(calendar_payload(), "k1")).unwrap();
        assert!(receipt.success);
        let (response, etag) = writer.response_for("cal-1/evt-1").unwrap();
        assert_eq!(response, AttendeeResponse::Tentative);
        assert_eq!(receipt.updated_tag, Some(etag));
        assert_eq!(writer.invocations(), 1);
    }

    #[test]
    fn calendar_rejects_payments() {
        let writer = SandboxCalendarWriter::new();
        let receipt = writer.perform(&request(payment_payload(10), "k1")).unwrap();
        assert!(!receipt.success);
        assert!(receipt.message.unwrap().contains("payment"));
    }

    #[test]
    fn payment_limit_rejects_large_amounts() {
        let writer = MockPaymentWriter::new().with_limit(Money::new(1_000, "USD"));
        assert!(writer.perform(&request(payment_payload(999), "k1")).unwrap().success);
        assert!(!writer.perform(&request(payment_payload(1_001), "k2")).unwrap().success);
        assert_eq!(writer.payments().len(), 1);
        assert_eq!(writer.invocations(), 2);
    }

    #[test]
    fn fail_writer_errors() {
        let writer = AlwaysFailWriter::new("flaky", "connection reset");
        assert!(matches!(
            writer.perform(&request(payment_payload(1), "k1")),
            Err(BoundaryError::ProviderFailure { .. })
        ));
    }

    #[test]
    fn policy_verifier_prefers_intersection_entry() {
        let verifier = StaticPolicyVerifier::new().with_policy("circle-a", "circle-hash");
        verifier
            .set("circle-a", Some("family"), "family-hash")
            .unwrap();

        assert_eq!(
            verifier.live_policy_hash("circle-a", Some("family")).unwrap(),
            "family-hash"
        );
        assert_eq!(
            verifier.live_policy_hash("circle-a", Some("work")).unwrap(),
            "circle-hash"
        );
        assert!(verifier.live_policy_hash("circle-b", None).is_err());
    }

    #[test]
    fn view_verifier_tracks_external_edits() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let snapshot = ViewSnapshot {
            provider: SandboxCalendarWriter::PROVIDER.to_string(),
            resource_id: "cal-1/evt-1".to_string(),
            etag: "etag-1".to_string(),
            last_updated: at,
            captured_at: at,
        };
        let verifier = StaticViewVerifier::new().with_snapshot(&snapshot);
        let live = verifier
            .live_view(SandboxCalendarWriter::PROVIDER, "cal-1/evt-1")
            .unwrap();
        assert_eq!(live.view_hash, snapshot.view_hash());

        verifier
            .touch(&snapshot, "etag-2", at + chrono::Duration::minutes(1))
            .unwrap();
        let live = verifier
            .live_view(SandboxCalendarWriter::PROVIDER, "cal-1/evt-1")
            .unwrap();
        assert_ne!(live.view_hash, snapshot.view_hash());
        assert_eq!(live.tag, "etag-2");
    }

    #[test]
    fn poisoned_verifier_locks_are_reported() {
        let policy = Arc::new(StaticPolicyVerifier::new().with_policy("circle-a", "hash-1"));
        let views = Arc::new(StaticViewVerifier::new().with_view("cal", "evt", "view-1", "etag-1"));

        let (p, v) = (policy.clone(), views.clone());
        let _ = std::thread::spawn(move || {
            let _hashes = p.hashes.write().unwrap();
            let _views = v.views.write().unwrap();
            panic!("writer died holding the locks");
        })
        .join();

        assert!(matches!(
            policy.set("circle-a", None, "hash-2"),
            Err(BoundaryError::Store(_))
        ));
        assert!(matches!(
            views.set("cal", "evt", "view-2", "etag-2"),
            Err(BoundaryError::Store(_))
        ));
        assert!(policy.live_policy_hash("circle-a", None).is_err());
        assert!(views.live_view("cal", "evt").is_err());
    }
}
