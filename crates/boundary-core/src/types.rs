use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a sealed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(pub String);

impl EnvelopeId {
    pub fn generate() -> Self {
        Self(format!("env-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EnvelopeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Deterministic fingerprint of an intent; the unit approvals are bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionHash(pub String);

impl ActionHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of external effect an intent asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    EmailSend,
    CalendarRespond,
    Payment,
    Transfer,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmailSend => "email_send",
            Self::CalendarRespond => "calendar_respond",
            Self::Payment => "payment",
            Self::Transfer => "transfer",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monetary amount in minor units (cents).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: u64,
    pub currency: String,
}

impl Money {
    pub fn new(amount_minor: u64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into().to_ascii_uppercase(),
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount_minor, self.currency)
    }
}

/// Attendee answer for a calendar invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendeeResponse {
    Accept,
    Decline,
    Tentative,
}

impl AttendeeResponse {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
            Self::Tentative => "tentative",
        }
    }
}

/// Action-specific payload. The variant determines the [`ActionType`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionPayload {
    EmailSend {
        message_id: String,
        thread_id: Option<String>,
        recipient: String,
        subject: String,
    },
    CalendarRespond {
        calendar_id: String,
        event_id: String,
        response: AttendeeResponse,
    },
    Payment {
        payee_id: String,
        amount: Money,
        reference: String,
    },
    Transfer {
        from_account: String,
        to_account: String,
        amount: Money,
    },
}

impl ActionPayload {
    pub fn action_type(&self) -> ActionType {
        match self {
            Self::EmailSend { .. } => ActionType::EmailSend,
            Self::CalendarRespond { .. } => ActionType::CalendarRespond,
            Self::Payment { .. } => ActionType::Payment,
            Self::Transfer { .. } => ActionType::Transfer,
        }
    }

    pub fn amount(&self) -> Option<&Money> {
        match self {
            Self::Payment { amount, .. } | Self::Transfer { amount, .. } => Some(amount),
            Self::EmailSend { .. } | Self::CalendarRespond { .. } => None,
        }
    }

    /// Payee, recipient or destination of the effect.
    pub fn recipient(&self) -> &str {
        match self {
            Self::EmailSend { recipient, .. } => recipient,
            Self::CalendarRespond { calendar_id, .. } => calendar_id,
            Self::Payment { payee_id, .. } => payee_id,
            Self::Transfer { to_account, .. } => to_account,
        }
    }

    /// External resource whose view state justified the intent.
    pub fn resource_id(&self) -> String {
        match self {
            Self::EmailSend {
                message_id,
                thread_id,
                ..
            } => thread_id.clone().unwrap_or_else(|| message_id.clone()),
            Self::CalendarRespond {
                calendar_id,
                event_id,
                ..
            } => format!("{calendar_id}/{event_id}"),
            Self::Payment { payee_id, .. } => payee_id.clone(),
            Self::Transfer { from_account, .. } => from_account.clone(),
        }
    }
}

/// Immutable description of a requested external action.
///
/// Produced upstream by draft review; the boundary only ever reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: String,
    pub circle_id: String,
    pub intersection_id: Option<String>,
    pub provider: String,
    pub payload: ActionPayload,
    /// Hash of the view state that justified this intent.
    pub view_hash: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Intent {
    pub fn new(
        circle_id: impl Into<String>,
        provider: impl Into<String>,
        payload: ActionPayload,
        view_hash: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            intent_id: format!("intent-{}", Uuid::new_v4()),
            circle_id: circle_id.into(),
            intersection_id: None,
            provider: provider.into(),
            payload,
            view_hash: view_hash.into(),
            description: String::new(),
            created_at,
        }
    }

    pub fn with_id(mut self, intent_id: impl Into<String>) -> Self {
        self.intent_id = intent_id.into();
        self
    }

    pub fn with_intersection(mut self, intersection_id: impl Into<String>) -> Self {
        self.intersection_id = Some(intersection_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }

    pub fn amount(&self) -> Option<&Money> {
        self.payload.amount()
    }

    pub fn resource_id(&self) -> String {
        self.payload.resource_id()
    }
}
