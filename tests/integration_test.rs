// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the whole coordinator: a real proxy and a real
/// coordinator runtime wired to an in-process pub/sub store stub, driven by
/// raw RESP clients exactly as managers and volunteers drive production.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use foreman_config::Config;
use foreman_coord::coordinator;
use foreman_protocol::{resp, Frame, FrameReader};
use foreman_proxy::Proxy;
use foreman_store::{
    Catalog, MemoryStore, Performance, Task, TaskStatus, Volunteer, VolunteerStatus,
};

// ── In-process pub/sub store ──────────────────────────────────────────────────

/// A minimal upstream store: routes `PUBLISH` to `SUBSCRIBE`/`PSUBSCRIBE`
/// connections, enough for the proxy to run against.
struct StubStore {
    addr: std::net::SocketAddr,
}

type Subscribers = Arc<Mutex<Vec<(Vec<String>, Vec<String>, mpsc::UnboundedSender<Vec<u8>>)>>>;

async fn spawn_stub_store() -> StubStore {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let subscribers = subscribers.clone();
            tokio::spawn(serve_connection(stream, subscribers));
        }
    });

    StubStore { addr }
}

async fn serve_connection(stream: TcpStream, subscribers: Subscribers) {
    let (mut read, mut write) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if write.write_all(&bytes).await.is_err() {
                return;
            }
        }
    });

    let index = {
        let mut subs = subscribers.lock().await;
        subs.push((Vec::new(), Vec::new(), out_tx.clone()));
        subs.len() - 1
    };

    let mut reader = FrameReader::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = match read.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        reader.feed(&buf[..n]);
        while let Some(frame) = reader.next_frame() {
            let Frame::Command { name, args, .. } = &frame else {
                continue;
            };
            match name.as_str() {
                "SUBSCRIBE" | "PSUBSCRIBE" => {
                    let mut subs = subscribers.lock().await;
                    for (i, ch) in args.iter().enumerate() {
                        let channel = String::from_utf8_lossy(ch).to_string();
                        let confirm = resp::encode_array(&[
                            name.to_lowercase().as_bytes(),
                            ch,
                            format!("{}", i + 1).as_bytes(),
                        ]);
                        out_tx.send(confirm).ok();
                        if name == "SUBSCRIBE" {
                            subs[index].0.push(channel);
                        } else {
                            subs[index].1.push(channel);
                        }
                    }
                }
                "PUBLISH" => {
                    let channel = String::from_utf8_lossy(&args[0]).to_string();
                    let payload = args[1].clone();
                    let subs = subscribers.lock().await;
                    let mut delivered = 0;
                    for (channels, patterns, tx) in subs.iter() {
                        if channels.iter().any(|c| c == &channel) {
                            tx.send(resp::encode_message(&channel, &payload)).ok();
                            delivered += 1;
                        } else if let Some(pattern) =
                            patterns.iter().find(|p| matches_pattern(p, &channel))
                        {
                            let frame = resp::encode_array(&[
                                b"pmessage",
                                pattern.as_bytes(),
                                channel.as_bytes(),
                                &payload,
                            ]);
                            tx.send(frame).ok();
                            delivered += 1;
                        }
                    }
                    out_tx.send(format!(":{delivered}\r\n").into_bytes()).ok();
                }
                "PING" => {
                    out_tx.send(b"+PONG\r\n".to_vec()).ok();
                }
                _ => {
                    out_tx.send(b"+OK\r\n".to_vec()).ok();
                }
            }
        }
    }
}

fn matches_pattern(pattern: &str, channel: &str) -> bool {
    pattern
        .strip_suffix('*')
        .map(|prefix| channel.starts_with(prefix))
        .unwrap_or(pattern == channel)
}

// ── RESP test client ──────────────────────────────────────────────────────────

/// Drives the proxy the way a manager or volunteer node does: raw RESP over
/// TCP, JSON envelopes in the payloads.
struct BusClient {
    stream: TcpStream,
    reader: FrameReader,
    /// Fan-out deliveries that arrived while waiting for something else.
    messages: Vec<(String, Value)>,
}

impl BusClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            reader: FrameReader::new(),
            messages: Vec::new(),
        }
    }

    async fn subscribe(&mut self, channels: &[&str]) {
        self.stream
            .write_all(&resp::encode_subscribe("SUBSCRIBE", channels))
            .await
            .unwrap();
        // Confirmations arrive asynchronously; drain them as plain frames.
        for _ in channels {
            self.next_frame(Duration::from_secs(5)).await.unwrap();
        }
    }

    /// Publish an envelope; returns the request id used.
    async fn publish(&mut self, channel: &str, data: Value, token: Option<&str>) -> Uuid {
        let request_id = Uuid::new_v4();
        self.publish_with_id(channel, data, token, request_id).await;
        request_id
    }

    async fn publish_with_id(
        &mut self,
        channel: &str,
        data: Value,
        token: Option<&str>,
        request_id: Uuid,
    ) {
        let mut envelope = json!({
            "request_id": request_id.to_string(),
            "sender": {"type": "manager", "id": "test-client"},
            "message_type": "request",
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });
        if let Some(token) = token {
            envelope["token"] = json!(token);
        }
        let payload = serde_json::to_vec(&envelope).unwrap();
        self.stream
            .write_all(&resp::encode_publish(channel, &payload))
            .await
            .unwrap();
    }

    /// Read one frame off the socket, buffering nothing else.
    async fn next_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.reader.next_frame() {
                return Some(frame);
            }
            let mut buf = [0u8; 8192];
            let n = tokio::time::timeout_at(deadline, self.stream.read(&mut buf))
                .await
                .ok()?
                .ok()?;
            if n == 0 {
                return None;
            }
            self.reader.feed(&buf[..n]);
        }
    }

    /// Await the next fan-out delivery on `channel`, skipping replies and
    /// unrelated deliveries.
    async fn next_message_on(&mut self, channel: &str, timeout: Duration) -> Option<Value> {
        if let Some(pos) = self.messages.iter().position(|(c, _)| c == channel) {
            return Some(self.messages.remove(pos).1);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            let frame = self.next_frame(remaining).await?;
            let Frame::Command { name, args, .. } = frame else {
                continue;
            };
            if name == "MESSAGE" && args.len() >= 2 {
                let ch = String::from_utf8_lossy(&args[0]).to_string();
                let Ok(value) = serde_json::from_slice::<Value>(&args[1]) else {
                    continue;
                };
                if ch == channel {
                    return Some(value);
                }
                self.messages.push((ch, value));
            }
        }
    }

    /// Await the correlated response envelope for `request_id`.
    async fn await_response(&mut self, channel: &str, request_id: Uuid) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            assert!(
                tokio::time::Instant::now() < deadline,
                "no response on {channel} for {request_id}"
            );
            let value = self
                .next_message_on(channel, Duration::from_secs(10))
                .await
                .unwrap_or_else(|| panic!("no message on {channel}"));
            if value["request_id"] == json!(request_id.to_string()) {
                return value;
            }
        }
    }

    /// Expect a wire-level error reply (`-ERR …`).
    async fn expect_error_reply(&mut self, needle: &str) {
        let frame = self
            .next_frame(Duration::from_secs(5))
            .await
            .expect("expected an error reply");
        let raw = String::from_utf8_lossy(frame.raw()).to_string();
        assert!(
            raw.starts_with('-') && raw.contains(needle),
            "expected error containing {needle:?}, got {raw:?}"
        );
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

struct Deployment {
    proxy_addr: std::net::SocketAddr,
    catalog: Catalog,
    config: Config,
    /// Holds the coordinator token file for the lifetime of the test.
    _token_dir: tempfile::TempDir,
}

/// Boot store stub → proxy → coordinator and hand back the pieces.
async fn deploy() -> Deployment {
    let stub = spawn_stub_store().await;

    let mut config = Config::default();
    config.proxy.listen_host = "127.0.0.1".into();
    config.proxy.listen_port = 0;
    // Keep the ACL honest: test clients come from loopback too, so nothing
    // is trusted. The coordinator authenticates with its own token instead.
    config.proxy.trusted_addrs = vec![];
    config.upstream.host = stub.addr.ip().to_string();
    config.upstream.port = stub.addr.port();
    config.token.secret = "integration-secret".into();
    let token_dir = tempfile::tempdir().unwrap();
    config.token.coordinator_token_file = token_dir
        .path()
        .join("token")
        .to_string_lossy()
        .into_owned();

    let catalog = Catalog::new(Arc::new(MemoryStore::new()));

    let bound = Proxy::new(&config).bind().await.unwrap();
    let proxy_addr = bound.local_addr().unwrap();
    tokio::spawn(bound.run());

    config.proxy.listen_port = proxy_addr.port();
    coordinator::start(&config, catalog.clone()).await.unwrap();

    // Let the fan-out listener and the coordinator's bulk subscription
    // settle before tests start publishing.
    tokio::time::sleep(Duration::from_millis(500)).await;

    Deployment {
        proxy_addr,
        catalog,
        config,
        _token_dir: token_dir,
    }
}

fn volunteer_fixture(trust: f64, completed: u64) -> Volunteer {
    Volunteer {
        id: Uuid::new_v4(),
        username: format!("volunteer-{trust}"),
        password_hash: String::new(),
        name: "fixture-node".into(),
        cpu_model: "Xeon".into(),
        cpu_cores: 8,
        total_ram_mb: 16384,
        available_storage_gb: 100,
        os: "linux".into(),
        gpu_available: false,
        gpu_model: None,
        gpu_memory_mb: None,
        ip: "10.0.0.5".into(),
        port: 9000,
        status: VolunteerStatus::Available,
        last_activity: Utc::now(),
        performance: Performance {
            tasks_total: completed,
            tasks_completed: completed,
            tasks_failed: 0,
            trust_score: trust,
        },
        machine_fingerprint: Default::default(),
    }
}

fn machine_payload(username: &str) -> Value {
    json!({
        "username": username,
        "name": "garage-server",
        "cpu_model": "Ryzen 9 7950X",
        "cpu_cores": 16,
        "total_ram_mb": 65536,
        "available_storage_gb": 500,
        "operating_system": "Ubuntu 24.04",
        "ip_address": "192.168.1.50",
        "communication_port": 9100,
        "machine_info": {
            "hostname": "garage-server",
            "os": {"architecture": "x86_64"},
            "cpu": {"max_frequency": 5700},
            "bios": {"serial_number": "BIOS-GARAGE-1"},
            "motherboard": {"serial_number": "MB-GARAGE-1"}
        }
    })
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn manager_registration_and_duplicate_email() {
    let deployment = deploy().await;
    let mut client = BusClient::connect(deployment.proxy_addr).await;
    client.subscribe(&["auth/register_response"]).await;

    let data = json!({"username": "alice", "email": "a@x.io", "password": "s3cr3t"});
    let request_id = client.publish("auth/register", data.clone(), None).await;
    let response = client
        .await_response("auth/register_response", request_id)
        .await;
    assert_eq!(response["data"]["status"], "success");
    let manager_id = response["data"]["manager_id"].as_str().unwrap();
    Uuid::parse_str(manager_id).expect("manager_id is a uuid");

    // Second identical registration trips the email uniqueness check.
    let request_id = client.publish("auth/register", data, None).await;
    let response = client
        .await_response("auth/register_response", request_id)
        .await;
    assert_eq!(response["data"]["status"], "error");
    let message = response["data"]["message"].as_str().unwrap();
    assert!(message.contains("email"), "got: {message}");
}

#[tokio::test]
async fn login_then_publish_on_manager_channel() {
    let deployment = deploy().await;
    let mut client = BusClient::connect(deployment.proxy_addr).await;
    client
        .subscribe(&["auth/register_response", "auth/login_response"])
        .await;

    let request_id = client
        .publish(
            "auth/register",
            json!({"username": "bob", "email": "b@x.io", "password": "hunter2"}),
            None,
        )
        .await;
    client
        .await_response("auth/register_response", request_id)
        .await;

    let request_id = client
        .publish(
            "auth/login",
            json!({"username": "bob", "password": "hunter2"}),
            None,
        )
        .await;
    let response = client.await_response("auth/login_response", request_id).await;
    assert_eq!(response["data"]["status"], "success");
    let token = response["data"]["token"].as_str().unwrap().to_string();
    assert!(response["data"]["refresh_token"].is_string());

    // A second client listens on tasks/new to observe what the proxy
    // actually forwards.
    let mut observer = BusClient::connect(deployment.proxy_addr).await;
    observer.subscribe(&["tasks/new"]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    client
        .publish("tasks/new", json!({"x": 1}), Some(&token))
        .await;
    let delivered = observer
        .next_message_on("tasks/new", Duration::from_secs(5))
        .await
        .expect("tasks/new delivery");
    assert_eq!(delivered["data"]["x"], 1);
    assert_eq!(delivered["_sender_role"], "manager");
    assert!(delivered["_sender_id"].is_string());
    assert!(delivered["_timestamp"].is_string());
    assert!(delivered["_client_ip"].is_string());
    assert!(delivered.get("token").is_none(), "token must be stripped");
}

#[tokio::test]
async fn publish_without_token_is_denied_at_the_wire() {
    let deployment = deploy().await;
    let mut client = BusClient::connect(deployment.proxy_addr).await;
    client.publish("tasks/new", json!({"x": 1}), None).await;
    client.expect_error_reply("NOAUTH Permission denied").await;
}

#[tokio::test]
async fn volunteer_dedup_by_machine_fingerprint() {
    let deployment = deploy().await;
    let mut client = BusClient::connect(deployment.proxy_addr).await;
    client.subscribe(&["auth/volunteer_register_response"]).await;

    let request_id = client
        .publish("auth/volunteer_register", machine_payload("node-alpha"), None)
        .await;
    let response = client
        .await_response("auth/volunteer_register_response", request_id)
        .await;
    assert_eq!(response["data"]["status"], "success");
    assert_eq!(response["data"]["is_update"], false);
    let first_id = response["data"]["volunteer_id"].as_str().unwrap().to_string();

    // Same machine, different username: the row is updated, not duplicated.
    let request_id = client
        .publish("auth/volunteer_register", machine_payload("node-beta"), None)
        .await;
    let response = client
        .await_response("auth/volunteer_register_response", request_id)
        .await;
    assert_eq!(response["data"]["status"], "success");
    assert_eq!(response["data"]["is_update"], true);
    assert_eq!(response["data"]["volunteer_id"].as_str().unwrap(), first_id);

    let all = deployment.catalog.all_volunteers().await.unwrap();
    assert_eq!(all.len(), 1, "one volunteer row for one machine");
    assert_eq!(all[0].username, "node-beta");
}

#[tokio::test]
async fn workflow_placement_orders_by_trust() {
    let deployment = deploy().await;

    // A registered manager owns the workflow.
    let mut client = BusClient::connect(deployment.proxy_addr).await;
    client
        .subscribe(&["auth/register_response", "workflow/submit_response"])
        .await;
    let request_id = client
        .publish(
            "auth/register",
            json!({"username": "carol", "email": "c@x.io", "password": "pw"}),
            None,
        )
        .await;
    let response = client
        .await_response("auth/register_response", request_id)
        .await;
    let owner = response["data"]["manager_id"].as_str().unwrap().to_string();

    for (trust, completed) in [(10.0, 1), (50.0, 5), (90.0, 9)] {
        deployment
            .catalog
            .insert_volunteer(&volunteer_fixture(trust, completed))
            .await
            .unwrap();
    }

    let request_id = client
        .publish(
            "workflow/submit",
            json!({
                "workflow_id": Uuid::new_v4().to_string(),
                "workflow_name": "render-farm",
                "workflow_type": "RENDERING",
                "owner": owner,
                "estimated_resources": {"cpu_cores": 2, "memory_mb": 1024, "disk_mb": 500},
            }),
            None,
        )
        .await;
    let response = client
        .await_response("workflow/submit_response", request_id)
        .await;
    assert_eq!(response["data"]["status"], "success");
    let trusts: Vec<f64> = response["data"]["volunteers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["trust_score"].as_f64().unwrap())
        .collect();
    assert_eq!(trusts, vec![90.0, 50.0, 10.0]);
}

#[tokio::test]
async fn reassignment_with_no_candidates() {
    let deployment = deploy().await;

    let task = Task {
        id: Uuid::new_v4(),
        workflow: Uuid::new_v4(),
        name: "shard-7".into(),
        command: "crunch --shard 7".into(),
        dependencies: vec![],
        status: TaskStatus::Failed,
        assigned_volunteer: None,
        progress: 0.0,
        required_resources: Default::default(),
        attempts: 1,
        results: None,
        error: Some("volunteer lost".into()),
        start_time: None,
        end_time: None,
    };
    deployment.catalog.insert_task(&task).await.unwrap();

    let mut client = BusClient::connect(deployment.proxy_addr).await;
    client.subscribe(&["task/reassignment/response"]).await;

    // The estimate exceeds anything registered (there are no volunteers).
    client
        .publish(
            "task/reassignment",
            json!({
                "task_id": task.id.to_string(),
                "manager_id": Uuid::new_v4().to_string(),
                "estimated_resources": {"cpu_cores": 128, "memory_mb": 1048576, "disk_mb": 16777216},
            }),
            Some(&coordinator_token(&deployment.config)),
        )
        .await;

    let response = client
        .next_message_on("task/reassignment/response", Duration::from_secs(10))
        .await
        .expect("reassignment response");
    assert_eq!(response["data"]["success"], false);
    assert_eq!(response["data"]["error"], "Aucun volontaire disponible");

    let stored = deployment.catalog.task_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::PendingReassignment);
    assert_eq!(stored.attempts, 2, "each reassignment pass costs an attempt");
}

/// Read the coordinator's token back from the file it persists at startup.
fn coordinator_token(config: &Config) -> String {
    std::fs::read_to_string(&config.token.coordinator_token_file)
        .expect("coordinator token file")
        .trim()
        .to_string()
}

#[tokio::test]
async fn trust_score_accounting_is_idempotent() {
    let deployment = deploy().await;
    let volunteer = volunteer_fixture(0.0, 0);
    deployment.catalog.insert_volunteer(&volunteer).await.unwrap();

    let mut client = BusClient::connect(deployment.proxy_addr).await;
    let token = coordinator_token(&deployment.config);
    let task_id = Uuid::new_v4().to_string();

    // The same terminal event three times over; it must count once.
    for _ in 0..3 {
        client
            .publish(
                "task/status",
                json!({
                    "task_id": task_id,
                    "status": "completed",
                    "volunteer_id": volunteer.id.to_string(),
                }),
                Some(&token),
            )
            .await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    let stored = deployment
        .catalog
        .volunteer_by_id(volunteer.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.performance.tasks_total, 1);
    assert_eq!(stored.performance.tasks_completed, 1);
    assert_eq!(stored.performance.trust_score, 100.0);

    // Message log rows exist for the publications that went through the
    // coordinator's own client.
    let logged = deployment
        .catalog
        .count_messages_on_channel("auth/register_response")
        .await
        .unwrap();
    // No registrations in this test; just assert the call works.
    assert_eq!(logged, 0);
}
