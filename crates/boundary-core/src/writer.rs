//! Provider writers, the per-provider idempotency cache and the live-mode
//! permit that gates every provider call.

use crate::envelope::Envelope;
use crate::error::BoundaryError;
use crate::types::{ActionHash, ActionPayload, EnvelopeId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Whether provider calls are allowed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Live,
    #[default]
    DryRun,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::DryRun => "dry_run",
        }
    }

    /// The only way to obtain a [`LiveExecutionPermit`].
    pub fn live_permit(self) -> Option<LiveExecutionPermit> {
        match self {
            Self::Live => Some(LiveExecutionPermit { _sealed: () }),
            Self::DryRun => None,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof that the boundary runs in live mode. Required by [`WriterRegistry::invoke`].
#[derive(Debug)]
pub struct LiveExecutionPermit {
    _sealed: (),
}

/// What a writer is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub envelope_id: EnvelopeId,
    pub trace_id: String,
    pub circle_id: String,
    pub provider: String,
    pub resource_id: String,
    pub action_hash: ActionHash,
    pub idempotency_key: String,
    pub payload: ActionPayload,
}

impl ActionRequest {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            envelope_id: envelope.envelope_id().clone(),
            trace_id: envelope.trace_id().to_string(),
            circle_id: envelope.circle_id().to_string(),
            provider: envelope.provider().to_string(),
            resource_id: envelope.intent().resource_id(),
            action_hash: envelope.action_hash().clone(),
            idempotency_key: envelope.idempotency_key().to_string(),
            payload: envelope.intent().payload.clone(),
        }
    }
}

/// Writer response, cached under its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub success: bool,
    pub updated_tag: Option<String>,
    pub provider_response_id: String,
    pub idempotency_key: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// A provider capable of performing external side effects.
pub trait Writer: Send + Sync {
    fn provider_id(&self) -> &str;

    fn is_sandbox(&self) -> bool;

    fn perform(&self, request: &ActionRequest) -> Result<Receipt, BoundaryError>;
}

/// Bounded map of idempotency key to receipt. Oldest entry is evicted first.
#[derive(Debug)]
pub struct IdempotencyCache {
    capacity: usize,
    receipts: HashMap<String, Receipt>,
    order: VecDeque<String>,
}

impl IdempotencyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            receipts: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Receipt> {
        self.receipts.get(key)
    }

    pub fn insert(&mut self, key: String, receipt: Receipt) {
        if self.receipts.insert(key.clone(), receipt).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.receipts.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receipts.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Receipt obtained through a live-mode provider call or a cache replay.
///
/// Only [`WriterRegistry::invoke`] constructs one, and a successful
/// settlement can only be built from one.
#[derive(Debug, Clone)]
pub struct ProviderInvocation {
    provider: String,
    receipt: Receipt,
    replayed: bool,
}

impl ProviderInvocation {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn receipt(&self) -> &Receipt {
        &self.receipt
    }

    /// True when served from the idempotency cache.
    pub fn replayed(&self) -> bool {
        self.replayed
    }
}

struct WriterSlot {
    writer: Arc<dyn Writer>,
    cache: Mutex<IdempotencyCache>,
}

/// Writers keyed by provider ID, each with its own idempotency cache.
pub struct WriterRegistry {
    slots: HashMap<String, WriterSlot>,
    cache_capacity: usize,
}

impl WriterRegistry {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            cache_capacity,
        }
    }

    /// Register a writer. Re-registering a provider replaces the writer and
    /// starts a fresh cache.
    pub fn register(&mut self, writer: Arc<dyn Writer>) {
        let provider = writer.provider_id().to_string();
        info!(
            provider = %provider,
            sandbox = writer.is_sandbox(),
            "Writer registered"
        );
        self.slots.insert(
            provider,
            WriterSlot {
                writer,
                cache: Mutex::new(IdempotencyCache::new(self.cache_capacity)),
            },
        );
    }

    pub fn has(&self, provider: &str) -> bool {
        self.slots.contains_key(provider)
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn Writer>> {
        self.slots.get(provider).map(|slot| slot.writer.clone())
    }

    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self.slots.keys().cloned().collect();
        providers.sort();
        providers
    }

    pub fn cached_receipt(
        &self,
        provider: &str,
        idempotency_key: &str,
    ) -> Result<Option<Receipt>, BoundaryError> {
        let slot = self.slot(provider)?;
        let cache = slot
            .cache
            .lock()
            .map_err(|_| BoundaryError::lock_poisoned("idempotency cache"))?;
        Ok(cache.get(idempotency_key).cloned())
    }

    /// Perform the request at most once per idempotency key.
    ///
    /// The cache lock is held across lookup, provider call and store, so
    /// concurrent callers sharing a key observe a single effect. Writer
    /// errors are returned as [`BoundaryError::ProviderFailure`] and are not
    /// cached.
    pub fn invoke(
        &self,
        _permit: &LiveExecutionPermit,
        request: &ActionRequest,
    ) -> Result<ProviderInvocation, BoundaryError> {
        let slot = self.slot(&request.provider)?;
        let mut cache = slot
            .cache
            .lock()
            .map_err(|_| BoundaryError::lock_poisoned("idempotency cache"))?;

        if let Some(receipt) = cache.get(&request.idempotency_key) {
            debug!(
                provider = %request.provider,
                idempotency_key = %request.idempotency_key,
                "Idempotent replay"
            );
            return Ok(ProviderInvocation {
                provider: request.provider.clone(),
                receipt: receipt.clone(),
                replayed: true,
            });
        }

        let receipt =
            slot.writer
                .perform(request)
                .map_err(|err| BoundaryError::ProviderFailure {
                    provider: request.provider.clone(),
                    message: err.to_string(),
                })?;
        cache.insert(request.idempotency_key.clone(), receipt.clone());

        info!(
            provider = %request.provider,
            envelope_id = %request.envelope_id,
            success = receipt.success,
            provider_response_id = %receipt.provider_response_id,
            "Provider invoked"
        );
        Ok(ProviderInvocation {
            provider: request.provider.clone(),
            receipt,
            replayed: false,
        })
    }

    fn slot(&self, provider: &str) -> Result<&WriterSlot, BoundaryError> {
        self.slots
            .get(provider)
            .ok_or_else(|| BoundaryError::UnknownProvider(provider.to_string()))
    }
}

impl Default for WriterRegistry {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Money;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingWriter {
        calls: AtomicUsize,
        fail: bool,
    }

    impl Writer for CountingWriter {
        fn provider_id(&self) -> &str {
            "counting"
        }

        fn is_sandbox(&self) -> bool {
            true
        }

        fn perform(&self, request: &ActionRequest) -> Result<Receipt, BoundaryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(BoundaryError::Store("provider offline".to_string()));
            }
            Ok(Receipt {
                success: true,
                updated_tag: None,
                provider_response_id: format!("resp-{n}"),
                idempotency_key: request.idempotency_key.clone(),
                message: None,
            })
        }
    }

    fn request(key: &str) -> ActionRequest {
        ActionRequest {
            envelope_id: EnvelopeId::from("env-1"),
            trace_id: "trace-1".to_string(),
            circle_id: "circle-a".to_string(),
            provider: "counting".to_string(),
            resource_id: "payee-1".to_string(),
            action_hash: ActionHash("hash".to_string()),
            idempotency_key: key.to_string(),
            payload: ActionPayload::Payment {
                payee_id: "payee-1".to_string(),
                amount: Money::new(10, "USD"),
                reference: "r".to_string(),
            },
        }
    }

    fn registry(fail: bool) -> (WriterRegistry, Arc<CountingWriter>) {
        let writer = Arc::new(CountingWriter {
            calls: AtomicUsize::new(0),
            fail,
        });
        let mut registry = WriterRegistry::new(8);
        registry.register(writer.clone());
        (registry, writer)
    }

    #[test]
    fn dry_run_has_no_permit() {
        assert!(ExecutionMode::DryRun.live_permit().is_none());
        assert!(ExecutionMode::Live.live_permit().is_some());
        assert_eq!(ExecutionMode::default(), ExecutionMode::DryRun);
    }

    #[test]
    fn same_key_performs_once() {
        let (registry, writer) = registry(false);
        let permit = ExecutionMode::Live.live_permit().unwrap();

        let first = registry.invoke(&permit, &request("k1")).unwrap();
        let second = registry.invoke(&permit, &request("k1")).unwrap();

        assert_eq!(writer.calls.load(Ordering::SeqCst), 1);
        assert!(!first.replayed());
        assert!(second.replayed());
        assert_eq!(
            first.receipt().provider_response_id,
            second.receipt().provider_response_id
        );
    }

    #[test]
    fn errors_are_not_cached() {
        let (registry, writer) = registry(true);
        let permit = ExecutionMode::Live.live_permit().unwrap();

        let err = registry.invoke(&permit, &request("k1")).unwrap_err();
        assert!(matches!(err, BoundaryError::ProviderFailure { .. }));
        assert!(registry.cached_receipt("counting", "k1").unwrap().is_none());
        assert!(registry.invoke(&permit, &request("k1")).is_err());
        assert_eq!(writer.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_provider_fails_closed() {
        let registry = WriterRegistry::default();
        let permit = ExecutionMode::Live.live_permit().unwrap();
        assert!(matches!(
            registry.invoke(&permit, &request("k1")),
            Err(BoundaryError::UnknownProvider(_))
        ));
    }

    #[test]
    fn cache_evicts_oldest_entry() {
        let mut cache = IdempotencyCache::new(2);
        let receipt = |id: &str| Receipt {
            success: true,
            updated_tag: None,
            provider_response_id: id.to_string(),
            idempotency_key: id.to_string(),
            message: None,
        };
        cache.insert("a".to_string(), receipt("a"));
        cache.insert("b".to_string(), receipt("b"));
        cache.insert("a".to_string(), receipt("a"));
        cache.insert("c".to_string(), receipt("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }
}
