// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The normalised message envelope carried as UTF-8 JSON in every pub/sub
//! payload.
//!
//! Every field is mandatory except `token`. Responses reuse the request's
//! `request_id` — that pairing is the only correlation guarantee in the
//! system; responses may arrive on any subscription.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Who a message came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// `"coordinator"`, `"manager"`, or `"volunteer"`.
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl Sender {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Message categories supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Event,
    Heartbeat,
    Error,
}

/// Standardised form of every message exchanged over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: Uuid,
    pub sender: Sender,
    pub message_type: MessageType,
    /// UTC ISO-8601 on the wire.
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Envelope {
    /// Build a request with a fresh `request_id`.
    pub fn request(sender: Sender, data: serde_json::Value) -> Self {
        Self::new(Uuid::new_v4(), sender, MessageType::Request, data)
    }

    /// Build an envelope with an explicit id and type. Used by the publish
    /// path, where the caller may be answering an earlier request.
    pub fn new(
        request_id: Uuid,
        sender: Sender,
        message_type: MessageType,
        data: serde_json::Value,
    ) -> Self {
        Self {
            request_id,
            sender,
            message_type,
            timestamp: Utc::now(),
            data,
            token: None,
        }
    }

    /// Build a response that reuses this request's `request_id`.
    pub fn response_to(&self, sender: Sender, data: serde_json::Value) -> Self {
        Self::new(self.request_id, sender, MessageType::Response, data)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Envelope)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(ProtocolError::Envelope)
    }

    /// Fetch a string field out of `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

/// Infer the message type for a channel when the caller did not specify one.
/// Channels whose name ends in `_response` carry responses.
pub fn implied_message_type(channel: &str) -> MessageType {
    if channel.ends_with("_response") {
        MessageType::Response
    } else {
        MessageType::Request
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
