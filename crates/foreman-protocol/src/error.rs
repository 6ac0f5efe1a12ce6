// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("envelope encode/decode error: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("token error: {0}")]
    Token(#[source] jsonwebtoken::errors::Error),
}
