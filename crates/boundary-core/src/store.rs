use crate::envelope::Envelope;
use crate::error::BoundaryError;
use crate::types::EnvelopeId;
use std::collections::HashMap;
use std::sync::RwLock;

/// Persistence for sealed envelopes.
pub trait EnvelopeStore: Send + Sync {
    fn put(&self, envelope: Envelope) -> Result<(), BoundaryError>;

    fn get(&self, envelope_id: &EnvelopeId) -> Result<Option<Envelope>, BoundaryError>;

    fn require(&self, envelope_id: &EnvelopeId) -> Result<Envelope, BoundaryError> {
        self.get(envelope_id)?
            .ok_or_else(|| BoundaryError::EnvelopeNotFound(envelope_id.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEnvelopeStore {
    envelopes: RwLock<HashMap<EnvelopeId, Envelope>>,
}

impl InMemoryEnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize, BoundaryError> {
        Ok(self
            .envelopes
            .read()
            .map_err(|_| BoundaryError::lock_poisoned("envelope store"))?
            .len())
    }
}

impl EnvelopeStore for InMemoryEnvelopeStore {
    fn put(&self, envelope: Envelope) -> Result<(), BoundaryError> {
        let mut envelopes = self
            .envelopes
            .write()
            .map_err(|_| BoundaryError::lock_poisoned("envelope store"))?;

        // A settled envelope is never overwritten.
        if let Some(existing) = envelopes.get(envelope.envelope_id()) {
            if existing.is_terminal() {
                return Err(BoundaryError::EnvelopeTerminal {
                    envelope_id: existing.envelope_id().to_string(),
                    status: existing.status().to_string(),
                });
            }
        }
        envelopes.insert(envelope.envelope_id().clone(), envelope);
        Ok(())
    }

    fn get(&self, envelope_id: &EnvelopeId) -> Result<Option<Envelope>, BoundaryError> {
        let envelopes = self
            .envelopes
            .read()
            .map_err(|_| BoundaryError::lock_poisoned("envelope store"))?;
        Ok(envelopes.get(envelope_id).cloned())
    }
}
