// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Payload transformers applied to every authorised publication.
//!
//! Transformers are pure: each takes the payload by reference and returns a
//! new value, so the inbound frame is never mutated in place. The pipeline
//! order is fixed — metadata injection, then sensitive-data filtering, then
//! the bearer-token strip.
//!
//! Two properties the tests pin down: an existing `data` key always survives
//! the pipeline unchanged, and after the pipeline any key named `password`
//! is either gone or equal to [`PASSWORD_MASK`] — except on `auth/register`,
//! where the registration handler needs the plaintext to hash it.

use serde_json::{Map, Value};

/// Fixed replacement for redacted password values.
pub const PASSWORD_MASK: &str = "********";

/// Channel whose handler requires the plaintext password.
const REGISTER_CHANNEL: &str = "auth/register";

/// Keys a registration payload may legitimately carry. Anything else is
/// dropped to keep stray fields out of the handler.
const REGISTER_SAFE_KEYS: &[&str] = &[
    "username",
    "email",
    "password",
    "request_id",
    "client_ip",
    "client_info",
    "sender",
    "message_type",
    "timestamp",
    "data",
];

/// Per-publication context the transformers draw from.
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub channel: String,
    /// Subject of the verified bearer token, when one was presented.
    pub sender_id: Option<String>,
    pub sender_role: Option<String>,
    pub client_ip: String,
}

/// Run the full pipeline over a payload, returning the transformed copy.
pub fn apply_pipeline(ctx: &TransformContext, payload: &Map<String, Value>) -> Map<String, Value> {
    let with_metadata = inject_metadata(ctx, payload);
    let mut filtered = filter_sensitive(ctx, &with_metadata);
    filtered.remove("token");
    filtered
}

/// Add `_sender_id`, `_sender_role`, `_timestamp`, `_client_ip`. Existing
/// keys are preserved; `data` in particular is never touched.
pub fn inject_metadata(
    ctx: &TransformContext,
    payload: &Map<String, Value>,
) -> Map<String, Value> {
    let mut out = payload.clone();
    if let Some(id) = &ctx.sender_id {
        out.insert("_sender_id".into(), Value::from(id.as_str()));
    }
    if let Some(role) = &ctx.sender_role {
        out.insert("_sender_role".into(), Value::from(role.as_str()));
    }
    out.insert(
        "_timestamp".into(),
        Value::from(chrono::Utc::now().to_rfc3339()),
    );
    out.insert("_client_ip".into(), Value::from(ctx.client_ip.as_str()));
    out
}

/// Redact credentials. On the registration channel the plaintext survives
/// but the payload is narrowed to the safe-key allowlist; everywhere else
/// every `password` value becomes the mask, at any nesting depth.
pub fn filter_sensitive(
    ctx: &TransformContext,
    payload: &Map<String, Value>,
) -> Map<String, Value> {
    if ctx.channel == REGISTER_CHANNEL {
        return payload
            .iter()
            .filter(|(k, _)| REGISTER_SAFE_KEYS.contains(&k.as_str()) || k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
    }

    let mut out = Map::with_capacity(payload.len());
    for (key, value) in payload {
        out.insert(key.clone(), mask_passwords(key, value));
    }
    out
}

fn mask_passwords(key: &str, value: &Value) -> Value {
    if key == "password" {
        return Value::from(PASSWORD_MASK);
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), mask_passwords(k, v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| mask_passwords("", v)).collect(),
        ),
        other => other.clone(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
