use crate::approval::ApprovalArtifact;
use crate::error::BoundaryError;
use crate::hashing::action_hash;
use crate::types::{ActionHash, ActionType, EnvelopeId, Intent, Money};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

/// Lifecycle status of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Pending,
    Executed,
    Blocked,
    Revoked,
    Expired,
    Aborted,
}

impl EnvelopeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executed => "executed",
            Self::Blocked => "blocked",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bounds on what an envelope may ever authorize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeCaps {
    pub amount_cap: Option<Money>,
    pub frequency_cap: u32,
    #[serde(with = "duration_secs_opt")]
    pub duration_cap: Option<Duration>,
}

impl Default for EnvelopeCaps {
    fn default() -> Self {
        Self {
            amount_cap: None,
            frequency_cap: 1,
            duration_cap: None,
        }
    }
}

/// Per-envelope sealing parameters supplied by the caller.
#[derive(Debug, Clone)]
pub struct SealingConfig {
    pub caps: EnvelopeCaps,
    pub approval_threshold: u32,
    pub expiry: DateTime<Utc>,
    pub revocation_window: Duration,
    pub policy_snapshot_hash: Option<String>,
    pub view_snapshot_hash: Option<String>,
    pub view_snapshot_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub trace_id: Option<String>,
}

impl SealingConfig {
    pub fn new(expiry: DateTime<Utc>) -> Self {
        Self {
            caps: EnvelopeCaps::default(),
            approval_threshold: 1,
            expiry,
            revocation_window: Duration::zero(),
            policy_snapshot_hash: None,
            view_snapshot_hash: None,
            view_snapshot_at: None,
            idempotency_key: None,
            trace_id: None,
        }
    }

    pub fn with_amount_cap(mut self, cap: Money) -> Self {
        self.caps.amount_cap = Some(cap);
        self
    }

    pub fn with_frequency_cap(mut self, frequency_cap: u32) -> Self {
        self.caps.frequency_cap = frequency_cap;
        self
    }

    pub fn with_duration_cap(mut self, duration_cap: Duration) -> Self {
        self.caps.duration_cap = Some(duration_cap);
        self
    }

    pub fn with_approval_threshold(mut self, threshold: u32) -> Self {
        self.approval_threshold = threshold;
        self
    }

    pub fn with_revocation_window(mut self, window: Duration) -> Self {
        self.revocation_window = window;
        self
    }

    pub fn with_policy_snapshot(mut self, policy_hash: impl Into<String>) -> Self {
        self.policy_snapshot_hash = Some(policy_hash.into());
        self
    }

    pub fn with_view_snapshot(
        mut self,
        view_hash: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        self.view_snapshot_hash = Some(view_hash.into());
        self.view_snapshot_at = Some(captured_at);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Sealed authorization wrapper around an intent.
///
/// After sealing, the only mutations are appending approvals and recording the
/// single terminal status. Both are refused once the envelope is terminal.
/// Fields are read through accessors so a held envelope cannot be loosened:
///
/// ```compile_fail
/// fn loosen(envelope: &mut boundary_core::Envelope) {
///     envelope.approval_threshold = 0;
/// }
/// ```
///
/// ```compile_fail
/// fn reopen(envelope: &mut boundary_core::Envelope) {
///     envelope.status = boundary_core::EnvelopeStatus::Pending;
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    envelope_id: EnvelopeId,
    intent: Intent,
    circle_id: String,
    intersection_id: Option<String>,
    action_type: ActionType,
    provider: String,
    caps: EnvelopeCaps,
    approval_threshold: u32,
    expiry: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    revocation_window: Duration,
    policy_snapshot_hash: String,
    view_snapshot_hash: String,
    view_snapshot_at: DateTime<Utc>,
    idempotency_key: String,
    trace_id: String,
    status: EnvelopeStatus,
    created_at: DateTime<Utc>,
    action_hash: ActionHash,
    approvals: Vec<ApprovalArtifact>,
}

impl Envelope {
    pub fn envelope_id(&self) -> &EnvelopeId {
        &self.envelope_id
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub fn circle_id(&self) -> &str {
        &self.circle_id
    }

    pub fn intersection_id(&self) -> Option<&str> {
        self.intersection_id.as_deref()
    }

    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn caps(&self) -> &EnvelopeCaps {
        &self.caps
    }

    pub fn approval_threshold(&self) -> u32 {
        self.approval_threshold
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    pub fn revocation_window(&self) -> Duration {
        self.revocation_window
    }

    pub fn policy_snapshot_hash(&self) -> &str {
        &self.policy_snapshot_hash
    }

    pub fn view_snapshot_hash(&self) -> &str {
        &self.view_snapshot_hash
    }

    pub fn view_snapshot_at(&self) -> DateTime<Utc> {
        self.view_snapshot_at
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn status(&self) -> EnvelopeStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn action_hash(&self) -> &ActionHash {
        &self.action_hash
    }

    pub fn approvals(&self) -> &[ApprovalArtifact] {
        &self.approvals
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn requested_amount(&self) -> Option<&Money> {
        self.intent.amount()
    }

    /// Earliest instant at which execution may proceed, or `None` when the
    /// window runs past the representable range.
    pub fn revocation_window_closes_at(&self) -> Option<DateTime<Utc>> {
        self.created_at.checked_add_signed(self.revocation_window)
    }

    pub(crate) fn attach_approval(
        &mut self,
        approval: ApprovalArtifact,
    ) -> Result<(), BoundaryError> {
        self.ensure_open()?;
        self.approvals.push(approval);
        Ok(())
    }

    pub(crate) fn record_terminal(&mut self, status: EnvelopeStatus) -> Result<(), BoundaryError> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Err(BoundaryError::InvalidSealing(
                "terminal status required".to_string(),
            ));
        }
        self.status = status;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), BoundaryError> {
        if self.is_terminal() {
            return Err(BoundaryError::EnvelopeTerminal {
                envelope_id: self.envelope_id.to_string(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }
}

/// Seals intents into envelopes.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder;

impl EnvelopeBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn seal(
        &self,
        intent: Intent,
        config: SealingConfig,
        now: DateTime<Utc>,
    ) -> Result<Envelope, BoundaryError> {
        let policy_snapshot_hash = required(config.policy_snapshot_hash, "policy snapshot hash")?;
        let view_snapshot_hash = required(config.view_snapshot_hash, "view snapshot hash")?;
        let view_snapshot_at = config
            .view_snapshot_at
            .ok_or(BoundaryError::MissingSnapshot("view snapshot time"))?;

        if !intent.view_hash.is_empty() && intent.view_hash != view_snapshot_hash {
            return Err(BoundaryError::InvalidSealing(format!(
                "intent view hash '{}' does not match view snapshot hash '{}'",
                intent.view_hash, view_snapshot_hash
            )));
        }
        if config.expiry <= now {
            return Err(BoundaryError::InvalidSealing(format!(
                "expiry {} is not after sealing time {}",
                config.expiry, now
            )));
        }
        if let Some(duration_cap) = config.caps.duration_cap {
            if config.expiry - now > duration_cap {
                return Err(BoundaryError::InvalidSealing(format!(
                    "expiry {} exceeds duration cap of {}s",
                    config.expiry,
                    duration_cap.num_seconds()
                )));
            }
        }
        if config.caps.frequency_cap == 0 {
            return Err(BoundaryError::InvalidSealing(
                "frequency cap must be at least 1".to_string(),
            ));
        }
        if config.approval_threshold == 0 {
            return Err(BoundaryError::InvalidSealing(
                "approval threshold must be at least 1".to_string(),
            ));
        }
        if config.revocation_window < Duration::zero() {
            return Err(BoundaryError::InvalidSealing(
                "revocation window cannot be negative".to_string(),
            ));
        }
        match now.checked_add_signed(config.revocation_window) {
            Some(closes_at) if closes_at <= config.expiry => {}
            _ => {
                return Err(BoundaryError::InvalidSealing(format!(
                    "revocation window of {}s closes after expiry {}",
                    config.revocation_window.num_seconds(),
                    config.expiry
                )))
            }
        }

        let action_hash = action_hash(&intent);
        let idempotency_key = match config.idempotency_key {
            Some(key) if key.trim().is_empty() => {
                return Err(BoundaryError::InvalidSealing(
                    "idempotency key cannot be blank".to_string(),
                ))
            }
            Some(key) => key,
            None => format!("{}:{}", intent.intent_id, action_hash),
        };
        let trace_id = config
            .trace_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let envelope = Envelope {
            envelope_id: EnvelopeId::generate(),
            circle_id: intent.circle_id.clone(),
            intersection_id: intent.intersection_id.clone(),
            action_type: intent.action_type(),
            provider: intent.provider.clone(),
            intent,
            caps: config.caps,
            approval_threshold: config.approval_threshold,
            expiry: config.expiry,
            revocation_window: config.revocation_window,
            policy_snapshot_hash,
            view_snapshot_hash,
            view_snapshot_at,
            idempotency_key,
            trace_id,
            status: EnvelopeStatus::Pending,
            created_at: now,
            action_hash,
            approvals: Vec::new(),
        };

        info!(
            envelope_id = %envelope.envelope_id,
            action_type = %envelope.action_type,
            provider = %envelope.provider,
            threshold = envelope.approval_threshold,
            "Envelope sealed"
        );

        Ok(envelope)
    }
}

fn required(value: Option<String>, what: &'static str) -> Result<String, BoundaryError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BoundaryError::MissingSnapshot(what)),
    }
}

mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        super::seconds(i64::deserialize(deserializer)?)
    }
}

mod duration_secs_opt {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.num_seconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<i64>::deserialize(deserializer)?
            .map(super::seconds)
            .transpose()
    }
}

fn seconds<E: serde::de::Error>(secs: i64) -> Result<Duration, E> {
    Duration::try_seconds(secs)
        .ok_or_else(|| E::custom(format!("duration of {secs}s is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionPayload;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap()
    }

    fn intent() -> Intent {
        Intent::new(
            "circle-a",
            "mock_payments",
            ActionPayload::Payment {
                payee_id: "payee-1".to_string(),
                amount: Money::new(1_200, "USD"),
                reference: "inv-1".to_string(),
            },
            "view-1",
            now(),
        )
        .with_id("intent-1")
    }

    fn config() -> SealingConfig {
        SealingConfig::new(now() + Duration::hours(1))
            .with_amount_cap(Money::new(2_000, "USD"))
            .with_revocation_window(Duration::minutes(5))
            .with_policy_snapshot("policy-1")
            .with_view_snapshot("view-1", now())
    }

    #[test]
    fn seals_pending_envelope_with_action_hash() {
        let envelope = EnvelopeBuilder::new().seal(intent(), config(), now()).unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Pending);
        assert_eq!(envelope.action_hash, action_hash(&intent()));
        assert_eq!(envelope.circle_id, "circle-a");
        assert_eq!(envelope.action_type, ActionType::Payment);
        assert_eq!(
            envelope.revocation_window_closes_at(),
            Some(now() + Duration::minutes(5))
        );
        assert!(envelope.idempotency_key.starts_with("intent-1:"));
        assert!(envelope.approvals().is_empty());
    }

    #[test]
    fn refuses_to_seal_without_policy_snapshot() {
        let mut cfg = config();
        cfg.policy_snapshot_hash = None;
        let err = EnvelopeBuilder::new().seal(intent(), cfg, now()).unwrap_err();
        assert!(matches!(err, BoundaryError::MissingSnapshot("policy snapshot hash")));
    }

    #[test]
    fn refuses_to_seal_without_view_snapshot() {
        let mut cfg = config();
        cfg.view_snapshot_hash = Some("  ".to_string());
        let err = EnvelopeBuilder::new().seal(intent(), cfg, now()).unwrap_err();
        assert!(matches!(err, BoundaryError::MissingSnapshot("view snapshot hash")));
    }

    #[test]
    fn refuses_mismatched_view_binding() {
        let cfg = config().with_view_snapshot("view-other", now());
        let err = EnvelopeBuilder::new().seal(intent(), cfg, now()).unwrap_err();
        assert!(matches!(err, BoundaryError::InvalidSealing(_)));
    }

    #[test]
    fn refuses_expiry_beyond_duration_cap() {
        let cfg = config().with_duration_cap(Duration::minutes(30));
        let err = EnvelopeBuilder::new().seal(intent(), cfg, now()).unwrap_err();
        assert!(err.to_string().contains("duration cap"));
    }

    #[test]
    fn refuses_past_expiry() {
        let mut cfg = config();
        cfg.expiry = now();
        assert!(EnvelopeBuilder::new().seal(intent(), cfg, now()).is_err());
    }

    #[test]
    fn terminal_envelope_rejects_further_mutation() {
        let mut envelope = EnvelopeBuilder::new().seal(intent(), config(), now()).unwrap();
        envelope.record_terminal(EnvelopeStatus::Blocked).unwrap();
        let err = envelope
            .record_terminal(EnvelopeStatus::Executed)
            .unwrap_err();
        assert!(matches!(err, BoundaryError::EnvelopeTerminal { .. }));
        assert_eq!(envelope.status, EnvelopeStatus::Blocked);
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let envelope = EnvelopeBuilder::new().seal(intent(), config(), now()).unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.revocation_window, Duration::minutes(5));
        assert_eq!(decoded.action_hash, envelope.action_hash);
    }

    #[test]
    fn refuses_zero_approval_threshold() {
        let cfg = config().with_approval_threshold(0);
        let err = EnvelopeBuilder::new().seal(intent(), cfg, now()).unwrap_err();
        assert!(matches!(err, BoundaryError::InvalidSealing(_)));
        assert!(err.to_string().contains("approval threshold"));
    }

    #[test]
    fn refuses_revocation_window_past_expiry() {
        let cfg = config().with_revocation_window(Duration::hours(2));
        let err = EnvelopeBuilder::new().seal(intent(), cfg, now()).unwrap_err();
        assert!(err.to_string().contains("closes after expiry"));

        let cfg = config().with_revocation_window(Duration::MAX);
        assert!(matches!(
            EnvelopeBuilder::new().seal(intent(), cfg, now()),
            Err(BoundaryError::InvalidSealing(_))
        ));

        let cfg = config().with_revocation_window(Duration::hours(1));
        assert!(EnvelopeBuilder::new().seal(intent(), cfg, now()).is_ok());
    }

    #[test]
    fn out_of_range_durations_fail_to_decode() {
        let envelope = EnvelopeBuilder::new().seal(intent(), config(), now()).unwrap();
        let mut value = serde_json::to_value(&envelope).unwrap();
        value["revocation_window"] = serde_json::json!(i64::MAX);
        let err = serde_json::from_value::<Envelope>(value).unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let mut value = serde_json::to_value(&envelope).unwrap();
        value["caps"]["duration_cap"] = serde_json::json!(i64::MIN);
        assert!(serde_json::from_value::<Envelope>(value).is_err());
    }

    #[test]
    fn overflowing_window_has_no_close_time() {
        let mut envelope = EnvelopeBuilder::new().seal(intent(), config(), now()).unwrap();
        envelope.revocation_window = Duration::MAX;
        assert_eq!(envelope.revocation_window_closes_at(), None);
    }
}
