// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Password hashing for managers and volunteers.
//!
//! Argon2id with a per-hash random salt. Verification goes through the same
//! primitive and is constant-time; there is no development-mode bypass.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};

/// Hash a plaintext password for storage.
pub fn hash(plaintext: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)?
        .to_string())
}

/// Verify a plaintext against a stored hash. Any parse or mismatch failure
/// is just `false` — callers respond with a uniform credentials error.
pub fn verify(plaintext: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_original_password() {
        let h = hash("s3cr3t").unwrap();
        assert!(verify("s3cr3t", &h));
    }

    #[test]
    fn wrong_password_is_rejected() {
        let h = hash("s3cr3t").unwrap();
        assert!(!verify("not-it", &h));
    }

    #[test]
    fn hash_never_equals_plaintext() {
        let h = hash("s3cr3t").unwrap();
        assert_ne!(h, "s3cr3t");
    }

    #[test]
    fn same_password_hashes_differently() {
        // Per-hash salts: equal inputs must not produce equal hashes.
        assert_ne!(hash("pw").unwrap(), hash("pw").unwrap());
    }

    #[test]
    fn malformed_stored_hash_is_just_false() {
        assert!(!verify("pw", "not-a-phc-string"));
    }
}
