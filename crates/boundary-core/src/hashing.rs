//! Canonical hashing for intents, snapshots and audit entries.
//!
//! Every digest is BLAKE3 over a domain-tagged JSON document. `serde_json`
//! objects keep keys sorted, so the encoding is stable across processes.

use crate::types::{ActionHash, Intent};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

const ACTION_DOMAIN: &str = "boundary.action.v1";

/// Hash an arbitrary canonical document under a domain tag.
pub fn digest(domain: &str, material: &Value) -> String {
    let document = serde_json::json!({
        "domain": domain,
        "material": material,
    });
    let bytes = serde_json::to_vec(&document).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Fixed-precision timestamp rendering used inside hashed material.
pub fn canonical_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Compute the ActionHash of an intent.
///
/// Covers identity (intent, circle, intersection), target provider, the full
/// payload, the justifying view hash and the creation instant.
pub fn action_hash(intent: &Intent) -> ActionHash {
    let amount = intent.amount().map(|money| {
        serde_json::json!({
            "amount_minor": money.amount_minor,
            "currency": money.currency,
        })
    });
    let payload = serde_json::to_value(&intent.payload).unwrap_or(Value::Null);

    let material = serde_json::json!({
        "intent_id": intent.intent_id,
        "circle_id": intent.circle_id,
        "intersection_id": intent.intersection_id,
        "action_type": intent.action_type().as_str(),
        "provider": intent.provider,
        "recipient": intent.payload.recipient(),
        "amount": amount,
        "payload": payload,
        "view_hash": intent.view_hash,
        "created_at": canonical_time(intent.created_at),
    });

    ActionHash(digest(ACTION_DOMAIN, &material))
}
