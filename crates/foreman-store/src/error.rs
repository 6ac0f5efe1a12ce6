// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{field} déjà utilisé")]
    Duplicate { field: String },

    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("document encode/decode error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn duplicate(field: impl Into<String>) -> Self {
        StoreError::Duplicate { field: field.into() }
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        StoreError::NotFound { entity: entity.into() }
    }
}
