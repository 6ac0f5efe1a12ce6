// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Control-plane message handlers.
//!
//! The registry is a flat map `channel → async fn` — a handler receives the
//! channel name and the decoded envelope and owns its own error reporting:
//! every failure becomes a `status:error` response on the paired
//! `_response` channel, and nothing propagates back into the dispatch loop.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};
use uuid::Uuid;

use foreman_protocol::{Envelope, MessageType, TokenService};
use foreman_store::Catalog;

use crate::client::{CoordClient, HandlerFn};

pub mod auth;
pub mod performance;
pub mod volunteer;
pub mod workflow;

use performance::StatusMemo;

/// Everything a handler needs, passed explicitly — no ambient globals.
pub struct HandlerContext {
    pub client: CoordClient,
    pub catalog: Catalog,
    pub tokens: TokenService,
    /// The coordinator's own bearer token for privileged publications.
    pub coordinator_token: String,
    /// Access-token lifetime; refresh tokens get seven times this.
    pub token_ttl_hours: i64,
    pub memo: StatusMemo,
}

/// Refresh tokens live seven times as long as access tokens.
pub const REFRESH_TTL_FACTOR: i64 = 7;

/// Adapt an `async fn(ctx, channel, envelope)` into a registry entry.
pub fn bind<F, Fut>(ctx: Arc<HandlerContext>, f: F) -> HandlerFn
where
    F: Fn(Arc<HandlerContext>, String, Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |channel, envelope| Box::pin(f(ctx.clone(), channel, envelope)))
}

/// Registry entry that subscribes a channel without acting on it. Used for
/// `_response` channels the request/response awaiter listens on.
pub fn noop_handler() -> HandlerFn {
    Arc::new(|channel, envelope| {
        Box::pin(async move {
            debug!(%channel, request_id = %envelope.request_id, "response observed");
        })
    })
}

// ── Shared handler plumbing ───────────────────────────────────────────────────

/// Publish a response envelope reusing the request's id. All coordinator
/// responses carry its privileged token.
pub(crate) async fn respond(
    ctx: &HandlerContext,
    channel: &str,
    request_id: Uuid,
    data: Value,
) {
    let result = ctx
        .client
        .publish(
            channel,
            data,
            Some(request_id),
            Some(ctx.coordinator_token.clone()),
            Some(MessageType::Response),
            None,
        )
        .await;
    if let Err(e) = result {
        error!(%channel, %request_id, "failed to publish response: {e}");
    }
}

pub(crate) async fn respond_error(
    ctx: &HandlerContext,
    channel: &str,
    request_id: Uuid,
    message: impl Into<String>,
) {
    let message = message.into();
    warn!(%channel, %request_id, "responding with error: {message}");
    respond(
        ctx,
        channel,
        request_id,
        json!({"status": "error", "message": message}),
    )
    .await;
}

/// The envelope's `data` as an object, or `None` for anything else.
pub(crate) fn data_object(envelope: &Envelope) -> Option<&Map<String, Value>> {
    envelope.data.as_object()
}

/// Fetch a mandatory string field, with the validation-taxonomy message on
/// absence.
pub(crate) fn require_str<'a>(
    data: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a str, String> {
    data.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Champ requis manquant: {field}"))
}

pub(crate) fn require_u64(data: &Map<String, Value>, field: &str) -> Result<u64, String> {
    data.get(field)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| format!("Champ requis manquant: {field}"))
}

// ── System handlers ───────────────────────────────────────────────────────────

/// `coord/heartbeat/*` — liveness pings, logged at debug.
pub async fn heartbeat_handler(_ctx: Arc<HandlerContext>, channel: String, envelope: Envelope) {
    debug!(
        %channel,
        sender_type = %envelope.sender.kind,
        sender_id = %envelope.sender.id,
        "heartbeat"
    );
}

/// `coord/emergency` — operator-visible incidents.
pub async fn emergency_handler(_ctx: Arc<HandlerContext>, channel: String, envelope: Envelope) {
    let code = envelope.data.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
    let message = envelope
        .data
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("Erreur inconnue");
    error!(%channel, code, "emergency: {message}");
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_str_reports_missing_field() {
        let data = json!({"username": "alice"}).as_object().unwrap().clone();
        assert_eq!(require_str(&data, "username").unwrap(), "alice");
        assert_eq!(
            require_str(&data, "password").unwrap_err(),
            "Champ requis manquant: password"
        );
    }

    #[test]
    fn require_str_rejects_empty_and_non_string() {
        let data = json!({"a": "", "b": 5}).as_object().unwrap().clone();
        assert!(require_str(&data, "a").is_err());
        assert!(require_str(&data, "b").is_err());
    }

    #[test]
    fn require_u64_parses_integers_only() {
        let data = json!({"cores": 8, "name": "x"}).as_object().unwrap().clone();
        assert_eq!(require_u64(&data, "cores").unwrap(), 8);
        assert!(require_u64(&data, "name").is_err());
    }
}
