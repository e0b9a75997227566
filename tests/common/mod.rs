// Shared fixtures for the integration tests: an in-process fake MCP server
// speaking newline-delimited JSON-RPC over `tokio::io::duplex` pipes, and a
// `Launcher` that hands the pool connections to it.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use mcp_gateway::adapter::launcher::{self, Launcher};
use mcp_gateway::adapter::{Connection, ConnectionOptions};
use mcp_gateway::config::{GatewayConfig, StartupStrategy};
use mcp_gateway::error::GatewayError;
use mcp_gateway::models::{HealthState, ServiceRecord, TransportConfig};
use mcp_gateway::state::AppState;

pub const CALLER: &str = "user-1";

/// Knobs and counters shared by every fake server instance.
#[derive(Default)]
pub struct FakeBehavior {
    pub launches: AtomicUsize,
    pub fail_launch: AtomicBool,
    pub fail_ping: AtomicBool,
    pub pings: AtomicUsize,
    /// Delay before each launch completes (widens spawn races).
    pub launch_delay_ms: AtomicUsize,
    /// Delay before answering each ping (keeps probes in flight).
    pub ping_delay_ms: AtomicUsize,
    pub cancelled: Mutex<Vec<Value>>,
    pub received: Mutex<Vec<Value>>,
}

impl FakeBehavior {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<Value> {
        self.cancelled.lock().unwrap().clone()
    }
}

pub struct FakeLauncher {
    pub behavior: Arc<FakeBehavior>,
    pub opts: ConnectionOptions,
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, record: &ServiceRecord) -> Result<Arc<Connection>, GatewayError> {
        self.behavior.launches.fetch_add(1, Ordering::SeqCst);
        let delay = self.behavior.launch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.behavior.fail_launch.load(Ordering::SeqCst) {
            return Err(GatewayError::SpawnError {
                service: record.slug.clone(),
                reason: "No such file or directory (os error 2)".into(),
            });
        }
        let conn = spawn_fake(record.id, &record.slug, self.behavior.clone(), self.opts.clone());
        launcher::initialize(conn, &record.slug, Duration::from_secs(5)).await
    }
}

/// Starts a fake server and returns an un-initialized connection to it.
pub fn spawn_fake(
    id: i64,
    slug: &str,
    behavior: Arc<FakeBehavior>,
    opts: ConnectionOptions,
) -> Arc<Connection> {
    let (client, server) = tokio::io::duplex(256 * 1024);
    let (client_r, client_w) = tokio::io::split(client);
    let (server_r, server_w) = tokio::io::split(server);
    tokio::spawn(fake_server(server_r, server_w, behavior));
    Connection::from_io(id, slug, client_r, client_w, opts)
}

async fn fake_server<R, W>(reader: R, mut writer: W, behavior: Arc<FakeBehavior>)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        behavior.received.lock().unwrap().push(msg.clone());
        let id = msg.get("id").cloned().unwrap_or(Value::Null);
        let method = msg.get("method").and_then(Value::as_str).unwrap_or_default();
        let params = msg.get("params").cloned().unwrap_or(Value::Null);

        let mut out: Vec<Value> = Vec::new();
        let mut exit_after = false;
        match method {
            "initialize" => out.push(result(
                &id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "fake", "version": "0.0.1" }
                }),
            )),
            "notifications/initialized" => {}
            "notifications/cancelled" => {
                let request_id = params.get("requestId").cloned().unwrap_or(Value::Null);
                behavior.cancelled.lock().unwrap().push(request_id);
            }
            "ping" => {
                behavior.pings.fetch_add(1, Ordering::SeqCst);
                let delay = behavior.ping_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                }
                if behavior.fail_ping.load(Ordering::SeqCst) {
                    out.push(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32603, "message": "internal error" }
                    }));
                } else {
                    out.push(result(&id, json!({})));
                }
            }
            "tools/list" => out.push(result(&id, json!({ "tools": [{ "name": "echo" }] }))),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                match name {
                    "echo" => out.push(result(&id, json!({ "echo": args }))),
                    "stream" => {
                        let token = params
                            .pointer("/_meta/progressToken")
                            .cloned()
                            .unwrap_or(Value::Null);
                        for step in 1..=5 {
                            out.push(json!({
                                "jsonrpc": "2.0",
                                "method": "notifications/progress",
                                "params": { "progressToken": token, "progress": step, "total": 5 }
                            }));
                        }
                        out.push(result(&id, json!({ "content": [{ "type": "text", "text": "done" }] })));
                    }
                    "broadcast" => {
                        out.push(json!({
                            "jsonrpc": "2.0",
                            "method": "notifications/message",
                            "params": { "level": "info", "data": "hello" }
                        }));
                        out.push(result(&id, json!({})));
                    }
                    "garbage" => {
                        for _ in 0..3 {
                            if writer.write_all(b"this is not json\n").await.is_err() {
                                return;
                            }
                        }
                        out.push(result(&id, json!({ "after": "garbage" })));
                    }
                    "hang" => {}
                    "crash" => return,
                    "answer_then_exit" => {
                        out.push(result(&id, json!({ "answered": true })));
                        exit_after = true;
                    }
                    _ => out.push(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32601, "message": "unknown tool" }
                    })),
                }
            }
            _ if msg.get("id").is_some() && !method.is_empty() => out.push(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "Method not found" }
            })),
            _ => {}
        }

        for frame in out {
            let mut bytes = serde_json::to_vec(&frame).unwrap();
            bytes.push(b'\n');
            if writer.write_all(&bytes).await.is_err() {
                return;
            }
        }
        if writer.flush().await.is_err() || exit_after {
            return;
        }
    }
}

fn result(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

// ── Records and state ──────────────────────────────────────────────

pub fn stdio_record(id: i64, slug: &str) -> ServiceRecord {
    ServiceRecord {
        id,
        name: slug.to_string(),
        slug: slug.to_string(),
        transport: TransportConfig::Stdio {
            command: "fake-mcp".into(),
            args: vec![],
            cwd: None,
            env: BTreeMap::new(),
        },
        enabled: true,
        health: HealthState::Unknown,
        install: None,
    }
}

pub fn http_record(id: i64, slug: &str, url: &str) -> ServiceRecord {
    ServiceRecord {
        transport: TransportConfig::Http { url: url.to_string() },
        ..stdio_record(id, slug)
    }
}

/// Short timings so crash, timeout and health paths finish quickly.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        call_timeout: Duration::from_secs(2),
        init_timeout: Duration::from_secs(2),
        restart_base: Duration::from_millis(10),
        restart_cap: Duration::from_millis(40),
        restart_max_crashes: 3,
        restart_window: Duration::from_secs(60),
        health_interval: Duration::from_secs(3600),
        health_jitter: Duration::ZERO,
        health_probe_timeout: Duration::from_millis(500),
        session_queue_capacity: 16,
        flow_control_grace: Duration::from_millis(200),
        startup_strategy: StartupStrategy::OnDemand,
        ..GatewayConfig::default()
    }
}

pub fn fake_state(config: GatewayConfig, records: Vec<ServiceRecord>) -> (AppState, Arc<FakeBehavior>) {
    let behavior = Arc::new(FakeBehavior::default());
    let opts = mcp_gateway::state::connection_options(&config);
    let launcher = Arc::new(FakeLauncher {
        behavior: behavior.clone(),
        opts,
    });
    let state = AppState::with_launcher(config, records, launcher);
    state.mark_ready();
    (state, behavior)
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn tool_call(id: Value, name: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": { "n": 1 } }
    })
}
