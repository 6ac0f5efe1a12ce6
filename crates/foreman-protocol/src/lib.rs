// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Shared protocol layer: the RESP wire codec, the JSON message envelope,
//! the channel catalogue with its publish-time ACL, and the bearer-token
//! service.

pub mod channels;
pub mod envelope;
pub mod error;
pub mod resp;
pub mod token;

pub use channels::{Access, ChannelRegistry, Role};
pub use envelope::{implied_message_type, Envelope, MessageType, Sender};
pub use error::ProtocolError;
pub use resp::{Frame, FrameReader};
pub use token::{Claims, TokenService, COORDINATOR_TOKEN_PATH};
