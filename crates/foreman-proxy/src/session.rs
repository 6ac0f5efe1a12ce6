// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-connection session state and the shared session table.
//!
//! A session is created on TCP accept and destroyed when either side of the
//! mediated connection closes. The table is shared between the accept task,
//! the per-connection tasks, and the fan-out task; one mutex guards the map
//! and each session serialises its own socket writes behind a second lock.
//! Fan-out never sends while holding the table lock — it snapshots the
//! subscriber list first.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tracing::debug;

use foreman_protocol::Role;

/// Authentication and subscription state of one client connection.
#[derive(Debug, Default)]
pub struct SessionState {
    pub authenticated: bool,
    pub subject_id: Option<String>,
    pub role: Option<Role>,
    pub token: Option<String>,
    /// Channels and patterns this client asked for. Patterns keep their
    /// trailing `*`; matching is prefix-based.
    pub subscribed: HashSet<String>,
}

pub struct Session {
    pub id: u64,
    pub remote_addr: SocketAddr,
    pub state: Mutex<SessionState>,
    writer: Mutex<OwnedWriteHalf>,
}

impl Session {
    /// Write raw bytes to the client, serialised per session.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await
    }

    /// Whether this session subscribed to `channel`, directly or through a
    /// pattern.
    pub async fn is_subscribed(&self, channel: &str) -> bool {
        let state = self.state.lock().await;
        state.subscribed.iter().any(|entry| {
            if let Some(prefix) = entry.strip_suffix('*').or_else(|| entry.strip_suffix('#')) {
                channel.starts_with(prefix)
            } else {
                entry == channel
            }
        })
    }

    pub async fn subscribe(&self, channels: impl IntoIterator<Item = String>) {
        let mut state = self.state.lock().await;
        state.subscribed.extend(channels);
    }

    pub async fn unsubscribe(&self, channels: &[String]) {
        let mut state = self.state.lock().await;
        if channels.is_empty() {
            // Bare UNSUBSCRIBE drops every subscription.
            state.subscribed.clear();
        } else {
            for ch in channels {
                state.subscribed.remove(ch);
            }
        }
    }

    /// Record a successful token-authenticated publish.
    pub async fn mark_authenticated(&self, subject_id: String, role: Role, token: String) {
        let mut state = self.state.lock().await;
        state.authenticated = true;
        state.subject_id = Some(subject_id);
        state.role = Some(role);
        state.token = Some(token);
    }
}

/// All live sessions, keyed by an id handed out at accept time.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, remote_addr: SocketAddr, writer: OwnedWriteHalf) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session {
            id,
            remote_addr,
            state: Mutex::new(SessionState::default()),
            writer: Mutex::new(writer),
        });
        self.sessions.lock().await.insert(id, session.clone());
        debug!(session = id, peer = %remote_addr, "session registered");
        session
    }

    pub async fn remove(&self, id: u64) {
        if self.sessions.lock().await.remove(&id).is_some() {
            debug!(session = id, "session removed");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Snapshot of every session subscribed to `channel`. Taken under the
    /// table lock, but sends happen after it is released.
    pub async fn subscribers_of(&self, channel: &str) -> Vec<Arc<Session>> {
        let snapshot: Vec<Arc<Session>> = {
            let sessions = self.sessions.lock().await;
            sessions.values().cloned().collect()
        };
        let mut subscribed = Vec::new();
        for session in snapshot {
            if session.is_subscribed(channel).await {
                subscribed.push(session);
            }
        }
        subscribed
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_session(table: &SessionTable) -> Arc<Session> {
        // A real socket pair so the write half exists; nothing is sent.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let _server = listener.accept().await.unwrap();
        let (_read, write) = client.into_split();
        table.register(addr, write).await
    }

    #[tokio::test]
    async fn exact_subscription_matches() {
        let table = SessionTable::new();
        let session = test_session(&table).await;
        session.subscribe(["tasks/new".to_string()]).await;
        assert!(session.is_subscribed("tasks/new").await);
        assert!(!session.is_subscribed("tasks/old").await);
    }

    #[tokio::test]
    async fn pattern_subscription_matches_prefix() {
        let table = SessionTable::new();
        let session = test_session(&table).await;
        session.subscribe(["tasks/result/*".to_string()]).await;
        assert!(session.is_subscribed("tasks/result/42").await);
        assert!(!session.is_subscribed("tasks/status/42").await);
    }

    #[tokio::test]
    async fn bare_unsubscribe_clears_everything() {
        let table = SessionTable::new();
        let session = test_session(&table).await;
        session
            .subscribe(["a".to_string(), "b".to_string()])
            .await;
        session.unsubscribe(&[]).await;
        assert!(!session.is_subscribed("a").await);
        assert!(!session.is_subscribed("b").await);
    }

    #[tokio::test]
    async fn subscribers_snapshot_only_includes_matching_sessions() {
        let table = SessionTable::new();
        let s1 = test_session(&table).await;
        let s2 = test_session(&table).await;
        s1.subscribe(["auth/login_response".to_string()]).await;
        s2.subscribe(["workflow/submit_response".to_string()]).await;

        let subs = table.subscribers_of("auth/login_response").await;
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, s1.id);
    }

    #[tokio::test]
    async fn removed_session_leaves_the_table() {
        let table = SessionTable::new();
        let session = test_session(&table).await;
        assert_eq!(table.len().await, 1);
        table.remove(session.id).await;
        assert_eq!(table.len().await, 0);
    }
}
