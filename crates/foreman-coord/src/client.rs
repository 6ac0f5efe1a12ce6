// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The coordinator's own pub/sub client.
//!
//! # Design
//!
//! ```text
//!  handlers ──► CoordClient::publish ──► publisher connection ──► proxy
//!                                                                   │
//!  workers ◄── bounded queue ◄── dispatch task ◄── subscriber conn ◄┘
//!     │
//!     └─► handler registry (channel → async fn)
//! ```
//!
//! Two TCP connections to the proxy: the subscriber connection issues one
//! bulk `SUBSCRIBE` for every registered channel and feeds the dispatch
//! loop; the publisher connection carries `PUBLISH` commands and their
//! replies. A lost subscriber connection is re-established with exponential
//! backoff (capped, so reconnect attempts stay at a handful per minute) and
//! the bulk subscription is re-issued each time.
//!
//! The client is a value owned by the process bootstrap and cloned into
//! handlers — there is no global instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chrono::Utc;
use foreman_config::CoordinatorConfig;
use foreman_protocol::{
    implied_message_type, resp, Envelope, Frame, FrameReader, MessageType, Sender,
};
use foreman_store::{Catalog, MessageLog};

use crate::error::CoordError;

/// Async handler invoked with the channel name and the decoded envelope.
pub type HandlerFn = Arc<dyn Fn(String, Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Snapshot of the client's counters.
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_activity: chrono::DateTime<Utc>,
    pub start_time: chrono::DateTime<Utc>,
    pub subscribed_channels: Vec<String>,
}

#[derive(Debug)]
struct Counters {
    messages_sent: u64,
    messages_received: u64,
    last_activity: chrono::DateTime<Utc>,
    start_time: chrono::DateTime<Utc>,
}

struct Inner {
    proxy_addr: String,
    client_type: String,
    client_id: String,
    config: CoordinatorConfig,
    catalog: Catalog,
    handlers: Mutex<HashMap<String, Vec<HandlerFn>>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>,
    publisher: Mutex<Option<TcpStream>>,
    counters: Mutex<Counters>,
    running: AtomicBool,
}

/// Cheap-to-clone handle to the coordinator's bus participation.
#[derive(Clone)]
pub struct CoordClient {
    inner: Arc<Inner>,
}

impl CoordClient {
    pub fn new(
        proxy_addr: impl Into<String>,
        client_type: impl Into<String>,
        client_id: impl Into<String>,
        config: CoordinatorConfig,
        catalog: Catalog,
    ) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(Inner {
                proxy_addr: proxy_addr.into(),
                client_type: client_type.into(),
                client_id: client_id.into(),
                config,
                catalog,
                handlers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                publisher: Mutex::new(None),
                counters: Mutex::new(Counters {
                    messages_sent: 0,
                    messages_received: 0,
                    last_activity: now,
                    start_time: now,
                }),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Register a handler for a channel. A trailing `*` subscribes the
    /// pattern form. Must be called before [`CoordClient::start`]; late
    /// registrations take effect at the next reconnect.
    pub async fn subscribe(&self, channel: impl Into<String>, handler: HandlerFn) {
        let channel = channel.into();
        let mut handlers = self.inner.handlers.lock().await;
        handlers.entry(channel).or_default().push(handler);
    }

    /// Connect to the proxy (with a bounded startup retry budget) and spawn
    /// the dispatch task.
    pub async fn start(&self) -> Result<(), CoordError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("client already running");
            return Ok(());
        }

        let mut attempt = 0;
        let stream = loop {
            attempt += 1;
            match TcpStream::connect(&self.inner.proxy_addr).await {
                Ok(stream) => break stream,
                Err(e) if attempt < self.inner.config.startup_retries => {
                    warn!(
                        attempt,
                        max = self.inner.config.startup_retries,
                        "proxy not reachable yet: {e}"
                    );
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(e) => {
                    self.inner.running.store(false, Ordering::SeqCst);
                    return Err(CoordError::Connection(e));
                }
            }
        };

        info!(
            addr = %self.inner.proxy_addr,
            client = %self.inner.client_id,
            "coordinator client connected"
        );
        *self.inner.publisher.lock().await = Some(stream);

        let client = self.clone();
        tokio::spawn(async move { client.dispatch_loop().await });
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> ClientStats {
        let counters = self.inner.counters.lock().await;
        let handlers = self.inner.handlers.lock().await;
        ClientStats {
            messages_sent: counters.messages_sent,
            messages_received: counters.messages_received,
            last_activity: counters.last_activity,
            start_time: counters.start_time,
            subscribed_channels: handlers.keys().cloned().collect(),
        }
    }

    // ── Publishing ────────────────────────────────────────────────────────

    /// Publish `data` on `channel`, returning the request id used.
    ///
    /// Fire-and-forget: the only wait is for the proxy's wire-level reply.
    /// Callers that need a response subscribe to the paired `_response`
    /// channel and correlate on the returned id (see [`CoordClient::request`]).
    pub async fn publish(
        &self,
        channel: &str,
        data: Value,
        request_id: Option<Uuid>,
        token: Option<String>,
        message_type: Option<MessageType>,
        real_sender_id: Option<String>,
    ) -> Result<Uuid, CoordError> {
        let message_type = message_type.unwrap_or_else(|| implied_message_type(channel));
        let sender_id = real_sender_id.unwrap_or_else(|| self.inner.client_id.clone());

        let mut envelope = Envelope::new(
            request_id.unwrap_or_else(Uuid::new_v4),
            Sender::new(self.inner.client_type.clone(), sender_id.clone()),
            message_type,
            data.clone(),
        );
        if let Some(token) = token {
            envelope = envelope.with_token(token);
        }
        let body = envelope.to_json()?;

        self.send_publish(channel, body.as_bytes()).await?;

        {
            let mut counters = self.inner.counters.lock().await;
            counters.messages_sent += 1;
            counters.last_activity = Utc::now();
        }

        // Log every publication. A failed insert must never fail the
        // publish itself.
        let row = MessageLog {
            id: Uuid::new_v4(),
            sender_type: self.inner.client_type.clone(),
            sender_id,
            receiver_type: receiver_type_for(channel).map(str::to_string),
            receiver_id: None,
            channel: channel.to_string(),
            request_id: envelope.request_id.to_string(),
            message_type: format!("{message_type:?}").to_lowercase(),
            content: data,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.inner.catalog.insert_message_log(&row).await {
            error!(%channel, "message log insert failed: {e}");
        }

        debug!(%channel, request_id = %envelope.request_id, "published");
        Ok(envelope.request_id)
    }

    /// Publish and await the correlated response on `response_channel`.
    ///
    /// The response channel must already have a registered subscription
    /// (any handler, or [`crate::handlers::noop_handler`]). Expiry of the
    /// soft timeout yields [`CoordError::Timeout`].
    pub async fn request(
        &self,
        channel: &str,
        response_channel: &str,
        data: Value,
        token: Option<String>,
    ) -> Result<Envelope, CoordError> {
        {
            let handlers = self.inner.handlers.lock().await;
            if !handlers.contains_key(response_channel) {
                return Err(CoordError::Wire(format!(
                    "no subscription on response channel {response_channel}"
                )));
            }
        }

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(request_id, tx);

        self.publish(channel, data, Some(request_id), token, None, None)
            .await?;

        let wait = Duration::from_secs(self.inner.config.response_timeout_secs);
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(envelope)) => Ok(envelope),
            _ => {
                self.inner.pending.lock().await.remove(&request_id);
                Err(CoordError::Timeout)
            }
        }
    }

    /// Write the frame on the publisher connection and check the reply.
    async fn send_publish(&self, channel: &str, payload: &[u8]) -> Result<(), CoordError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(CoordError::NotRunning);
        }
        let mut guard = self.inner.publisher.lock().await;
        if guard.is_none() {
            *guard = Some(TcpStream::connect(&self.inner.proxy_addr).await?);
        }
        let stream = guard.as_mut().expect("publisher connection present");

        let frame = resp::encode_publish(channel, payload);
        if let Err(e) = stream.write_all(&frame).await {
            // One reconnect attempt, then give up for this publish.
            warn!("publisher connection lost, reconnecting: {e}");
            let mut fresh = TcpStream::connect(&self.inner.proxy_addr).await?;
            fresh.write_all(&frame).await?;
            *guard = Some(fresh);
        }
        let stream = guard.as_mut().expect("publisher connection present");

        let timeout = Duration::from_secs(self.inner.config.read_timeout_secs);
        let mut reader = FrameReader::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = tokio::time::timeout(timeout, stream.read(&mut buf))
                .await
                .map_err(|_| CoordError::Wire("publish reply timed out".into()))??;
            if n == 0 {
                *guard = None;
                return Err(CoordError::Wire("proxy closed the connection".into()));
            }
            reader.feed(&buf[..n]);
            if let Some(frame) = reader.next_frame() {
                return check_publish_reply(&frame);
            }
        }
    }

    // ── Dispatch ──────────────────────────────────────────────────────────

    /// Reconnect-forever subscription loop. Each connected stretch issues
    /// one bulk subscription and pumps messages into the worker queue.
    async fn dispatch_loop(self) {
        // Bounded queue between the read loop and the handler workers.
        let (queue_tx, queue_rx) = mpsc::channel::<(String, Envelope)>(256);
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for _ in 0..4 {
            let client = self.clone();
            let queue_rx = queue_rx.clone();
            tokio::spawn(async move { client.worker_loop(queue_rx).await });
        }

        let mut backoff = Duration::from_secs(1);
        while self.inner.running.load(Ordering::SeqCst) {
            match self.subscription_run(&queue_tx).await {
                Ok(()) => backoff = Duration::from_secs(1),
                Err(e) => {
                    warn!("subscriber connection failed: {e}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    // Exponential backoff, capped so reconnect attempts
                    // stay at a few per minute.
                    backoff = (backoff * 2).min(Duration::from_secs(15));
                }
            }
        }
        info!("dispatch loop stopped");
    }

    async fn subscription_run(
        &self,
        queue: &mpsc::Sender<(String, Envelope)>,
    ) -> Result<(), CoordError> {
        let mut stream = TcpStream::connect(&self.inner.proxy_addr).await?;

        let (concrete, patterns) = {
            let handlers = self.inner.handlers.lock().await;
            let mut concrete = Vec::new();
            let mut patterns = Vec::new();
            for channel in handlers.keys() {
                if channel.ends_with('*') {
                    patterns.push(channel.clone());
                } else {
                    concrete.push(channel.clone());
                }
            }
            (concrete, patterns)
        };
        if !concrete.is_empty() {
            let refs: Vec<&str> = concrete.iter().map(String::as_str).collect();
            stream
                .write_all(&resp::encode_subscribe("SUBSCRIBE", &refs))
                .await?;
        }
        if !patterns.is_empty() {
            let refs: Vec<&str> = patterns.iter().map(String::as_str).collect();
            stream
                .write_all(&resp::encode_subscribe("PSUBSCRIBE", &refs))
                .await?;
        }
        info!(
            channels = concrete.len() + patterns.len(),
            "subscribed to control channels"
        );

        let poll = Duration::from_secs(self.inner.config.dispatch_poll_secs);
        let mut reader = FrameReader::new();
        let mut buf = [0u8; 8192];
        loop {
            if !self.inner.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            let n = match tokio::time::timeout(poll, stream.read(&mut buf)).await {
                // Poll tick with nothing to read: loop to re-check running.
                Err(_) => continue,
                Ok(n) => n?,
            };
            if n == 0 {
                return Err(CoordError::Wire("subscriber connection closed".into()));
            }
            reader.feed(&buf[..n]);
            while let Some(frame) = reader.next_frame() {
                self.dispatch_frame(&frame, queue).await;
            }
        }
    }

    async fn dispatch_frame(&self, frame: &Frame, queue: &mpsc::Sender<(String, Envelope)>) {
        let Frame::Command { name, args, .. } = frame else {
            return;
        };
        let (channel, payload) = match name.as_str() {
            "MESSAGE" if args.len() >= 2 => (&args[0], &args[1]),
            "PMESSAGE" if args.len() >= 3 => (&args[1], &args[2]),
            // Subscription confirmations and anything else.
            _ => return,
        };
        let channel = String::from_utf8_lossy(channel).to_string();

        let envelope = match std::str::from_utf8(payload)
            .ok()
            .and_then(|s| Envelope::from_json(s).ok())
        {
            Some(env) => env,
            None => {
                error!(%channel, "non-envelope payload, dropping");
                return;
            }
        };

        {
            let mut counters = self.inner.counters.lock().await;
            counters.messages_received += 1;
            counters.last_activity = Utc::now();
        }

        // Correlated waiter first: a response someone is blocked on does
        // not also go through the handler queue.
        if envelope.message_type == MessageType::Response {
            if let Some(tx) = self.inner.pending.lock().await.remove(&envelope.request_id) {
                let _ = tx.send(envelope);
                return;
            }
        }

        if queue.send((channel, envelope)).await.is_err() {
            error!("handler queue closed");
        }
    }

    async fn worker_loop(self, queue: Arc<Mutex<mpsc::Receiver<(String, Envelope)>>>) {
        loop {
            let item = { queue.lock().await.recv().await };
            let Some((channel, envelope)) = item else {
                return;
            };
            let handlers = {
                let map = self.inner.handlers.lock().await;
                lookup_handlers(&map, &channel)
            };
            if handlers.is_empty() {
                debug!(%channel, "no handler registered");
                continue;
            }
            for handler in handlers {
                handler(channel.clone(), envelope.clone()).await;
            }
        }
    }
}

/// Exact match first, then pattern entries (trailing `*`) by prefix.
fn lookup_handlers(map: &HashMap<String, Vec<HandlerFn>>, channel: &str) -> Vec<HandlerFn> {
    let mut found = Vec::new();
    if let Some(list) = map.get(channel) {
        found.extend(list.iter().cloned());
    }
    for (entry, list) in map {
        if let Some(prefix) = entry.strip_suffix('*') {
            if channel.starts_with(prefix) && entry != channel {
                found.extend(list.iter().cloned());
            }
        }
    }
    found
}

fn check_publish_reply(frame: &Frame) -> Result<(), CoordError> {
    match frame {
        Frame::Command { name, .. } if name.starts_with("ERR NOAUTH") => {
            Err(CoordError::PermissionDenied)
        }
        Frame::Command { name, raw, .. } if raw.first() == Some(&b'-') => {
            Err(CoordError::Wire(name.clone()))
        }
        _ => Ok(()),
    }
}

/// Receiver classification for the message log, derived from the channel
/// prefix.
fn receiver_type_for(channel: &str) -> Option<&'static str> {
    if channel.starts_with("manager/") {
        Some("manager")
    } else if channel.starts_with("volunteer/") {
        Some("volunteer")
    } else if channel.starts_with("coordinator/") {
        Some("coordinator")
    } else {
        None
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
