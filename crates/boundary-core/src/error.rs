use crate::language::LanguageViolation;
use thiserror::Error;

/// Structural failures of the execution boundary.
///
/// Blocking conditions (revocation, staleness, missing approvals, ...) are not
/// errors: they surface as [`crate::settlement::Settlement`] outcomes.
#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("envelope cannot be sealed: missing {0}")]
    MissingSnapshot(&'static str),

    #[error("invalid sealing configuration: {0}")]
    InvalidSealing(String),

    #[error("envelope '{0}' not found")]
    EnvelopeNotFound(String),

    #[error("envelope '{envelope_id}' is already settled as '{status}'")]
    EnvelopeTerminal { envelope_id: String, status: String },

    #[error("no writer registered for provider '{0}'")]
    UnknownProvider(String),

    #[error("approval prompt rejected: {}", render_violations(.0))]
    LanguageViolation(Vec<LanguageViolation>),

    #[error("approval is bound to a different ActionHash: expected '{expected}', got '{actual}'")]
    ApprovalActionHashMismatch { expected: String, actual: String },

    #[error("approval '{approval_id}' expired at {expired_at}")]
    ApprovalExpired {
        approval_id: String,
        expired_at: String,
    },

    #[error("approval request '{request_id}' expired at {expired_at}")]
    ApprovalRequestExpired {
        request_id: String,
        expired_at: String,
    },

    #[error("invalid approval: {0}")]
    InvalidApproval(String),

    #[error("invalid revocation: {0}")]
    InvalidRevocation(String),

    #[error("writer '{provider}' failed: {message}")]
    ProviderFailure { provider: String, message: String },

    #[error("verifier unavailable: {0}")]
    Verifier(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("audit error: {0}")]
    Audit(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BoundaryError {
    pub fn lock_poisoned(what: &str) -> Self {
        Self::Store(format!("{what} lock poisoned"))
    }
}

fn render_violations(violations: &[LanguageViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}:'{}'", v.category.as_str(), v.term))
        .collect::<Vec<_>>()
        .join(", ")
}
