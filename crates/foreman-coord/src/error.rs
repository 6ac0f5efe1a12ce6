// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(String),

    #[error("permission denied by proxy")]
    PermissionDenied,

    #[error("response wait timed out")]
    Timeout,

    #[error(transparent)]
    Store(#[from] foreman_store::StoreError),

    #[error(transparent)]
    Protocol(#[from] foreman_protocol::ProtocolError),

    #[error("client is not running")]
    NotRunning,
}
