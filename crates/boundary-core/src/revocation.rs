use crate::error::BoundaryError;
use crate::types::EnvelopeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Explicit withdrawal of consent for one envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationSignal {
    pub envelope_id: EnvelopeId,
    pub circle_id: String,
    pub actor_id: String,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
}

/// Authoritative record of revocations.
///
/// Append-only: there is no API to remove or override a signal.
#[derive(Debug, Default)]
pub struct RevocationRegistry {
    signals: RwLock<HashMap<EnvelopeId, RevocationSignal>>,
}

impl RevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a revocation. Repeated calls keep the first signal and return it.
    pub fn revoke(
        &self,
        envelope_id: &EnvelopeId,
        circle_id: &str,
        actor_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<RevocationSignal, BoundaryError> {
        let mut signals = self
            .signals
            .write()
            .map_err(|_| BoundaryError::lock_poisoned("revocation registry"))?;

        if let Some(existing) = signals.get(envelope_id) {
            debug!(envelope_id = %envelope_id, "Revocation already recorded");
            return Ok(existing.clone());
        }

        let signal = RevocationSignal {
            envelope_id: envelope_id.clone(),
            circle_id: circle_id.to_string(),
            actor_id: actor_id.to_string(),
            reason: reason.to_string(),
            revoked_at: now,
        };
        signals.insert(envelope_id.clone(), signal.clone());

        warn!(
            envelope_id = %envelope_id,
            actor = %actor_id,
            reason = %reason,
            "Envelope revoked"
        );
        Ok(signal)
    }

    pub fn is_revoked(&self, envelope_id: &EnvelopeId) -> Result<bool, BoundaryError> {
        Ok(self.signal_for(envelope_id)?.is_some())
    }

    pub fn signal_for(
        &self,
        envelope_id: &EnvelopeId,
    ) -> Result<Option<RevocationSignal>, BoundaryError> {
        let signals = self
            .signals
            .read()
            .map_err(|_| BoundaryError::lock_poisoned("revocation registry"))?;
        Ok(signals.get(envelope_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn revoke_is_idempotent_and_keeps_first_signal() {
        let registry = RevocationRegistry::new();
        let id = EnvelopeId::from("env-1");
        let t0 = Utc.with_ymd_and_hms(2025, 2, 2, 2, 2, 2).unwrap();

        assert!(!registry.is_revoked(&id).unwrap());
        let first = registry
            .revoke(&id, "circle-a", "owner", "changed my mind", t0)
            .unwrap();
        let second = registry
            .revoke(&id, "circle-a", "spouse", "duplicate", t0 + Duration::minutes(1))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(second.actor_id, "owner");
        assert!(registry.is_revoked(&id).unwrap());
        assert!(!registry.is_revoked(&EnvelopeId::from("env-2")).unwrap());
    }
}
