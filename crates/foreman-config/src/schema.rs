// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Configuration schema. Every field has a serde default so partial YAML
//! files merge cleanly; environment variables override the merged result
//! (see [`crate::loader`]).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub token: TokenConfig,
    pub store: StoreConfig,
    pub coordinator: CoordinatorConfig,
}

/// The authorisation proxy's own listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_host: String,
    pub listen_port: u16,
    /// Peer addresses whose connections bypass the ACL. The coordinator's
    /// own loopback connections are trusted.
    pub trusted_addrs: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".into(),
            listen_port: 6380,
            trusted_addrs: vec!["127.0.0.1".into(), "::1".into()],
        }
    }
}

/// The pub/sub store the proxy fronts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 6379,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HS256 signing secret. Deployments must override the default.
    pub secret: String,
    /// Access-token lifetime in hours. Refresh tokens get seven times this.
    pub ttl_hours: i64,
    /// Where the coordinator's own token is written at startup.
    pub coordinator_token_file: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "change-me".into(),
            ttl_hours: 24,
            coordinator_token_file: ".coordinator/redis_communication/token".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub uri: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: "memory://".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Socket-read timeout for control round trips, in seconds.
    pub read_timeout_secs: u64,
    /// Poll interval of the dispatch loop, in seconds.
    pub dispatch_poll_secs: u64,
    /// Soft bound on a request/response wait, in seconds.
    pub response_timeout_secs: u64,
    /// Initial-connection retry budget at startup.
    pub startup_retries: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 5,
            dispatch_poll_secs: 1,
            response_timeout_secs: 30,
            startup_retries: 5,
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
