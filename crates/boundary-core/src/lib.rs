//! Execution Boundary core.
//!
//! Every external side effect passes through here: intents are sealed into
//! envelopes, approvals are bound to an ActionHash, revocations are permanent,
//! live policy and view state are re-verified at execution time, providers are
//! invoked at most once per idempotency key, and every transition lands in a
//! hash-chained audit trail.

#![deny(unsafe_code)]

pub mod approval;
pub mod audit;
pub mod boundary;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod hashing;
pub mod language;
pub mod revocation;
pub mod runner;
pub mod settlement;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod validity;
pub mod verify;
pub mod writer;

pub use approval::{ApprovalArtifact, ApprovalManager, ApprovalRequest};
pub use audit::{
    verify_chain, AuditEvent, AuditEventKind, AuditMetadata, AuditStore, AuditSummary, AuditTrail,
    InMemoryAuditStore,
};
pub use boundary::{ExecutionBoundary, ExecutionBoundaryBuilder};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::BoundaryConfig;
pub use envelope::{Envelope, EnvelopeBuilder, EnvelopeCaps, EnvelopeStatus, SealingConfig};
pub use error::BoundaryError;
pub use hashing::action_hash;
pub use language::{LanguageChecker, LanguageViolation, ViolationCategory};
pub use revocation::{RevocationRegistry, RevocationSignal};
pub use runner::ExecutionRunner;
pub use settlement::{Settlement, SettlementStatus};
pub use snapshot::{PolicySnapshot, ViewSnapshot};
pub use store::{EnvelopeStore, InMemoryEnvelopeStore};
pub use types::{
    ActionHash, ActionPayload, ActionType, AttendeeResponse, EnvelopeId, Intent, Money,
};
pub use validity::{Condition, ConditionName, ValidityCheckResult, ValidityChecker};
pub use verify::{FreshnessPolicy, LiveView, PolicyVerifier, ViewVerifier};
pub use writer::{
    ActionRequest, ExecutionMode, IdempotencyCache, LiveExecutionPermit, ProviderInvocation,
    Receipt, Writer, WriterRegistry,
};
