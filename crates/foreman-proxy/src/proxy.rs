// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The authorisation proxy: a transparent interception layer between
//! pub/sub clients and the upstream store.
//!
//! # Topology
//!
//! ```text
//! client ──TCP──► per-connection task ──TCP──► upstream store
//!                   │ parse / ACL / transform
//!                   │
//!                   ├─ reply relay (upstream → client, pushes dropped)
//!                   │
//! fan-out task ◄────┴── SessionTable ◄── upstream subscription (all channels)
//! ```
//!
//! Each accepted client gets its own upstream connection and a mediation
//! task. Replies flow back over a per-connection relay; `message` pushes on
//! that connection are discarded because publication delivery is owned by
//! the single fan-out listener (see [`crate::fanout`]) — this is what keeps
//! one publication at exactly one delivered frame per subscriber.
//!
//! # Downstream rules
//!
//! - Non-pub/sub frames and anything unparseable are forwarded verbatim.
//! - `SUBSCRIBE`/`UNSUBSCRIBE` update the session's channel set and are
//!   forwarded as-is; subscription is permissive by design, the ACL bites
//!   on publish.
//! - `PUBLISH` payloads must be JSON objects; they pass the ACL, then the
//!   transformer pipeline, then re-serialisation into a fresh frame.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use foreman_config::Config;
use foreman_protocol::{resp, Access, ChannelRegistry, Claims, Frame, FrameReader, TokenService};

use crate::error::ProxyError;
use crate::fanout;
use crate::session::{Session, SessionTable};
use crate::transform::{apply_pipeline, TransformContext};

/// State shared by the accept task, connection tasks, and the fan-out task.
pub struct ProxyShared {
    pub registry: ChannelRegistry,
    pub tokens: TokenService,
    pub sessions: SessionTable,
    pub upstream_host: String,
    pub upstream_port: u16,
    trusted: HashSet<IpAddr>,
}

impl ProxyShared {
    fn is_trusted(&self, addr: IpAddr) -> bool {
        self.trusted.contains(&addr)
    }
}

/// The proxy server. Owns no connection state itself; everything lives in
/// [`ProxyShared`] so tasks can share it.
pub struct Proxy {
    shared: Arc<ProxyShared>,
    listen_addr: String,
}

impl Proxy {
    pub fn new(config: &Config) -> Self {
        let trusted = config
            .proxy
            .trusted_addrs
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        let shared = Arc::new(ProxyShared {
            registry: ChannelRegistry::default(),
            tokens: TokenService::new(&config.token.secret),
            sessions: SessionTable::new(),
            upstream_host: config.upstream.host.clone(),
            upstream_port: config.upstream.port,
            trusted,
        });
        Self {
            shared,
            listen_addr: format!("{}:{}", config.proxy.listen_host, config.proxy.listen_port),
        }
    }

    pub fn shared(&self) -> Arc<ProxyShared> {
        self.shared.clone()
    }

    /// Bind the listen socket. Split from [`BoundProxy::run`] so callers
    /// (and tests) can learn the bound address before serving.
    pub async fn bind(self) -> Result<BoundProxy, ProxyError> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.listen_addr.clone(),
                source,
            })?;
        info!(addr = %self.listen_addr, "proxy listening");
        Ok(BoundProxy {
            listener,
            shared: self.shared,
        })
    }
}

/// A proxy whose listener is bound and ready to accept.
pub struct BoundProxy {
    listener: TcpListener,
    shared: Arc<ProxyShared>,
}

impl BoundProxy {
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shared(&self) -> Arc<ProxyShared> {
        self.shared.clone()
    }

    /// Start the fan-out task and accept clients until the process shuts
    /// down.
    pub async fn run(self) -> Result<(), ProxyError> {
        tokio::spawn(fanout::run(self.shared.clone()));

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };
            debug!(%peer, "client connected");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, stream, peer).await {
                    debug!(%peer, "connection ended: {e}");
                }
            });
        }
    }
}

// ── Per-connection mediation ──────────────────────────────────────────────────

async fn handle_connection(
    shared: Arc<ProxyShared>,
    client: TcpStream,
    peer: std::net::SocketAddr,
) -> anyhow::Result<()> {
    let upstream =
        TcpStream::connect((shared.upstream_host.as_str(), shared.upstream_port)).await?;
    let (upstream_read, mut upstream_write) = upstream.into_split();
    let (client_read, client_write) = client.into_split();

    let session = shared.sessions.register(peer, client_write).await;
    let (upstream_gone_tx, mut upstream_gone_rx) = oneshot::channel();
    let relay = tokio::spawn(relay_replies(upstream_read, session.clone(), upstream_gone_tx));

    let result = async {
        let mut reader = FrameReader::new();
        let mut client_read = client_read;
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                read = client_read.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        debug!(session = session.id, "client closed");
                        return Ok(());
                    }
                    reader.feed(&buf[..n]);
                    while let Some(frame) = reader.next_frame() {
                        handle_frame(&shared, &session, &mut upstream_write, frame).await?;
                    }
                }
                _ = &mut upstream_gone_rx => {
                    debug!(session = session.id, "upstream closed, dropping client");
                    return Ok(());
                }
            }
        }
    }
    .await;

    relay.abort();
    shared.sessions.remove(session.id).await;
    result
}

/// Forward upstream replies to the client. `message`/`pmessage` pushes are
/// dropped here — the fan-out task is the single delivery path, so a client
/// whose own upstream connection is subscribed does not see duplicates.
async fn relay_replies(
    mut upstream: OwnedReadHalf,
    session: Arc<Session>,
    upstream_gone: oneshot::Sender<()>,
) {
    let mut reader = FrameReader::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match upstream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        reader.feed(&buf[..n]);
        while let Some(frame) = reader.next_frame() {
            if matches!(&frame, Frame::Command { name, .. } if name == "MESSAGE" || name == "PMESSAGE")
            {
                continue;
            }
            if session.send(frame.raw()).await.is_err() {
                let _ = upstream_gone.send(());
                return;
            }
        }
    }
    let _ = upstream_gone.send(());
}

async fn handle_frame(
    shared: &Arc<ProxyShared>,
    session: &Arc<Session>,
    upstream: &mut OwnedWriteHalf,
    frame: Frame,
) -> anyhow::Result<()> {
    match &frame {
        Frame::Command { name, args, raw } => match name.as_str() {
            "PUBLISH" => handle_publish(shared, session, upstream, &frame).await,
            "SUBSCRIBE" | "PSUBSCRIBE" => {
                let channels: Vec<String> = args
                    .iter()
                    .filter_map(|a| String::from_utf8(a.clone()).ok())
                    .collect();
                debug!(session = session.id, ?channels, "subscribe");
                session.subscribe(channels).await;
                upstream.write_all(raw).await?;
                Ok(())
            }
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => {
                let channels: Vec<String> = args
                    .iter()
                    .filter_map(|a| String::from_utf8(a.clone()).ok())
                    .collect();
                session.unsubscribe(&channels).await;
                upstream.write_all(raw).await?;
                Ok(())
            }
            // PING, CLIENT, and anything else: no ACL, forward untouched.
            _ => {
                upstream.write_all(raw).await?;
                Ok(())
            }
        },
        Frame::Opaque(raw) => {
            // Stay transparent for bytes we cannot parse.
            upstream.write_all(raw).await?;
            Ok(())
        }
    }
}

// ── PUBLISH path ──────────────────────────────────────────────────────────────

async fn handle_publish(
    shared: &Arc<ProxyShared>,
    session: &Arc<Session>,
    upstream: &mut OwnedWriteHalf,
    frame: &Frame,
) -> anyhow::Result<()> {
    let Frame::Command { args, raw, .. } = frame else {
        return Ok(());
    };
    let (Some(channel), Some(payload)) = (frame.arg_str(0).map(str::to_string), args.get(1))
    else {
        // PUBLISH without both arguments: let the upstream reject it.
        upstream.write_all(raw).await?;
        return Ok(());
    };

    // The payload must be a JSON object or the publication is refused.
    let map = match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!(session = session.id, %channel, "rejecting non-JSON publication");
            session
                .send(&resp::encode_error("ERR WRONGTYPE Invalid JSON format"))
                .await?;
            return Ok(());
        }
    };

    // A presented token is always verified so the sender identity can be
    // injected, even on open channels where it is not required for access.
    let mut claims: Option<Claims> = None;
    if let Some(token) = map.get("token").and_then(|v| v.as_str()) {
        match shared.tokens.verify(token) {
            Ok(c) => claims = Some(c),
            Err(e) => {
                warn!(session = session.id, %channel, "invalid token on publish: {e}")
            }
        }
    }

    let trusted = shared.is_trusted(session.remote_addr.ip());
    let open = matches!(shared.registry.access_for(&channel), Some(Access::Open));
    let role_allows = claims
        .as_ref()
        .map(|c| shared.registry.may_publish(&channel, Some(c.role)))
        .unwrap_or(false);

    if !(open || trusted || role_allows) {
        warn!(session = session.id, %channel, peer = %session.remote_addr, "publish denied");
        session
            .send(&resp::encode_error("ERR NOAUTH Permission denied"))
            .await?;
        return Ok(());
    }

    if let Some(c) = &claims {
        let token = map.get("token").and_then(|v| v.as_str()).unwrap_or_default();
        session
            .mark_authenticated(c.sub.clone(), c.role, token.to_string())
            .await;
    }

    let ctx = TransformContext {
        channel: channel.clone(),
        sender_id: claims.as_ref().map(|c| c.sub.clone()),
        sender_role: claims.as_ref().map(|c| c.role.as_str().to_string()),
        client_ip: session.remote_addr.ip().to_string(),
    };
    let transformed = apply_pipeline(&ctx, &map);
    let body = serde_json::to_vec(&Value::Object(transformed))?;

    debug!(session = session.id, %channel, "publish forwarded");
    upstream
        .write_all(&resp::encode_publish(&channel, &body))
        .await?;
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────
