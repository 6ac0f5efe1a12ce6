// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Short-lived signed bearer tokens.
//!
//! Tokens are compact HS256 JWTs carrying `{sub, role, iat, exp}` and signed
//! with the symmetric secret from configuration. The coordinator mints its
//! own token at startup and persists it to
//! `.coordinator/redis_communication/token` (mode 0o600) so operator tools
//! can read it for privileged publications.

use std::path::Path;

use anyhow::Context;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::channels::Role;
use crate::error::ProtocolError;

/// Signed token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the manager/volunteer id, or the coordinator's own id.
    pub sub: String,
    pub role: Role,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

/// Issues and verifies bearer tokens with a shared symmetric secret.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mint a token for `subject` valid for `ttl_hours` from now.
    pub fn issue(
        &self,
        subject: &str,
        role: Role,
        ttl_hours: i64,
    ) -> Result<String, ProtocolError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            role,
            iat: now.timestamp(),
            exp: (now + Duration::hours(ttl_hours)).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(ProtocolError::Token)
    }

    /// Verify signature and expiry, returning the payload.
    pub fn verify(&self, token: &str) -> Result<Claims, ProtocolError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(ProtocolError::Token)
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("TokenService").finish_non_exhaustive()
    }
}

// ── Coordinator token file ────────────────────────────────────────────────────

/// Default location of the coordinator's own access token.
pub const COORDINATOR_TOKEN_PATH: &str = ".coordinator/redis_communication/token";

/// Persist the coordinator token so operator tools can pick it up.
pub fn write_coordinator_token(path: &Path, token: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating token directory {}", parent.display()))?;
    }
    write_secret_file(path, token.as_bytes())
}

pub fn read_coordinator_token(path: &Path) -> anyhow::Result<String> {
    let token = std::fs::read_to_string(path)
        .with_context(|| format!("reading token file {}", path.display()))?;
    Ok(token.trim().to_string())
}

/// Write `data` to `path` with mode 0o600 on Unix (owner-read/write only).
fn write_secret_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("writing secret file {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
            .with_context(|| format!("writing secret file {}", path.display()))?;
    }
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_verify_round_trip() {
        let svc = TokenService::new("unit-test-secret");
        let token = svc.issue("manager-1", Role::Manager, 24).unwrap();
        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.sub, "manager-1");
        assert_eq!(claims.role, Role::Manager);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn expired_token_is_rejected() {
        let svc = TokenService::new("unit-test-secret");
        // Negative TTL puts exp in the past.
        let token = svc.issue("v-1", Role::Volunteer, -1).unwrap();
        assert!(svc.verify(&token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let issuer = TokenService::new("secret-a");
        let verifier = TokenService::new("secret-b");
        let token = issuer.issue("m-1", Role::Manager, 1).unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn malformed_token_is_rejected() {
        let svc = TokenService::new("unit-test-secret");
        assert!(svc.verify("not.a.jwt").is_err());
        assert!(svc.verify("").is_err());
    }

    #[test]
    fn coordinator_token_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        write_coordinator_token(&path, "the-token").unwrap();
        assert_eq!(read_coordinator_token(&path).unwrap(), "the-token");
    }

    #[cfg(unix)]
    #[test]
    fn coordinator_token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        write_coordinator_token(&path, "t").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
