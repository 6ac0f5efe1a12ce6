// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The upstream fan-out listener.
//!
//! One long-lived connection subscribes to every catalogued channel
//! (patterns via `PSUBSCRIBE`). Each `message` arriving from the upstream is
//! encoded into the server-to-client push frame exactly once and written to
//! every session whose subscription set covers the channel. A session whose
//! socket errors during delivery is removed; nobody else is affected.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use foreman_protocol::{resp, Frame, FrameReader};

use crate::proxy::ProxyShared;

/// Run the listener forever, reconnecting with a fixed delay when the
/// upstream connection is lost.
pub async fn run(shared: Arc<ProxyShared>) {
    loop {
        match listen_once(&shared).await {
            Ok(()) => info!("fan-out listener: upstream closed"),
            Err(e) => warn!("fan-out listener: {e}"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn listen_once(shared: &Arc<ProxyShared>) -> anyhow::Result<()> {
    let stream =
        TcpStream::connect((shared.upstream_host.as_str(), shared.upstream_port)).await?;
    let (mut read, mut write) = stream.into_split();

    let concrete = shared.registry.concrete_channels();
    write
        .write_all(&resp::encode_subscribe("SUBSCRIBE", &concrete))
        .await?;
    let patterns = shared.registry.pattern_channels();
    if !patterns.is_empty() {
        let refs: Vec<&str> = patterns.iter().map(String::as_str).collect();
        write
            .write_all(&resp::encode_subscribe("PSUBSCRIBE", &refs))
            .await?;
    }
    info!(
        channels = concrete.len(),
        patterns = patterns.len(),
        "fan-out listener subscribed"
    );

    let mut reader = FrameReader::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        reader.feed(&buf[..n]);
        while let Some(frame) = reader.next_frame() {
            let Frame::Command { name, args, .. } = &frame else {
                continue;
            };
            // `message` carries [channel, payload]; `pmessage` carries
            // [pattern, channel, payload]. Everything else on this
            // connection is a subscription confirmation.
            let (channel, payload) = match name.as_str() {
                "MESSAGE" if args.len() >= 2 => (&args[0], &args[1]),
                "PMESSAGE" if args.len() >= 3 => (&args[1], &args[2]),
                _ => continue,
            };
            let channel = String::from_utf8_lossy(channel).to_string();
            deliver(shared, &channel, payload).await;
        }
    }
}

/// Encode the push frame once and send it to every matching session.
pub(crate) async fn deliver(shared: &Arc<ProxyShared>, channel: &str, payload: &[u8]) {
    let frame = resp::encode_message(channel, payload);
    let subscribers = shared.sessions.subscribers_of(channel).await;
    if subscribers.is_empty() {
        debug!(%channel, "no subscribers for publication");
        return;
    }
    for session in subscribers {
        if let Err(e) = session.send(&frame).await {
            warn!(session = session.id, %channel, "delivery failed, dropping session: {e}");
            shared.sessions.remove(session.id).await;
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
