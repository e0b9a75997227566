// MCP Gateway - stdio child processes
//! Spawns a stdio MCP server and binds it to a [`Connection`].
//!
//! The child's stdin/stdout carry JSON-RPC lines; stderr is pumped into
//! tracing with a level guessed from its content. A supervise task waits for
//! process exit (reported as a crash) or for the connection's shutdown token
//! (the child is killed).

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio_util::sync::CancellationToken;

use super::{Connection, ConnectionOptions};
use crate::error::GatewayError;
use crate::models::{ServiceRecord, TransportConfig};

/// How long a killed child gets to be reaped before we stop waiting.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Launches the configured command. The command, arguments, working directory
/// and environment are passed through untouched.
pub fn spawn_stdio(
    record: &ServiceRecord,
    opts: ConnectionOptions,
) -> Result<Arc<Connection>, GatewayError> {
    let TransportConfig::Stdio {
        command,
        args,
        cwd,
        env,
    } = &record.transport
    else {
        return Err(GatewayError::SpawnError {
            service: record.slug.clone(),
            reason: "service is not a stdio service".into(),
        });
    };

    let mut cmd = Command::new(command);
    cmd.args(args);
    cmd.envs(env);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let spawn_failed = |reason: String| GatewayError::SpawnError {
        service: record.slug.clone(),
        reason,
    };

    let mut child = cmd
        .spawn()
        .map_err(|e| spawn_failed(format!("cannot launch '{command}': {e}")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;
    let stderr = child.stderr.take();

    tracing::info!(
        service = %record.slug,
        service_id = record.id,
        pid = child.id().unwrap_or_default(),
        "process: spawned '{}'",
        command
    );

    let conn = Connection::from_io(record.id, record.slug.clone(), stdout, stdin, opts);
    let token = conn.shutdown_token();

    if let Some(stderr) = stderr {
        tokio::spawn(pump_stderr(record.slug.clone(), stderr, token.clone()));
    }

    let watched = conn.clone();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => format!("process exited ({status})"),
                    Err(e) => format!("process wait failed: {e}"),
                };
                watched.crash(reason);
            }
            _ = token.cancelled() => {
                let _ = child.start_kill();
                if tokio::time::timeout(KILL_WAIT, child.wait()).await.is_err() {
                    tracing::warn!(service = %watched.service(), "process: child did not exit after kill");
                }
            }
        }
    });

    Ok(conn)
}

async fn pump_stderr(service: String, stderr: ChildStderr, token: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() || is_benign_close_message(line) {
                    continue;
                }
                match classify_stderr(line) {
                    StderrLevel::Info => tracing::info!(service = %service, "stderr: {}", line),
                    StderrLevel::Warn => tracing::warn!(service = %service, "stderr: {}", line),
                    StderrLevel::Error => tracing::error!(service = %service, "stderr: {}", line),
                }
            }
            Ok(None) => break,
            Err(e) => {
                if !is_benign_close_message(&e.to_string()) {
                    tracing::debug!(service = %service, "stderr: read failed: {}", e);
                }
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrLevel {
    Info,
    Warn,
    Error,
}

/// Servers write all sorts of chatter to stderr; only obvious problems are
/// raised above info.
pub fn classify_stderr(line: &str) -> StderrLevel {
    let lower = line.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&[
        "running on stdio",
        "server running",
        "started",
        "listening",
        "ready",
        "initialized",
        "starting",
    ]) {
        StderrLevel::Info
    } else if has(&["warning", "warn", "deprecated", "retry", "timeout"]) {
        StderrLevel::Warn
    } else if has(&[
        "error",
        "failed",
        "exception",
        "fatal",
        "critical",
        "crash",
        "panic",
    ]) {
        StderrLevel::Error
    } else {
        StderrLevel::Info
    }
}

/// Noise produced when pipes close during normal shutdown.
pub fn is_benign_close_message(line: &str) -> bool {
    let lower = line.to_lowercase();
    ["file already closed", "use of closed file", "closed pipe", "broken pipe"]
        .iter()
        .any(|n| lower.contains(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HealthState;
    use std::collections::BTreeMap;

    #[test]
    fn stderr_levels() {
        assert_eq!(classify_stderr("Server running on stdio"), StderrLevel::Info);
        assert_eq!(classify_stderr("DeprecationWarning: punycode"), StderrLevel::Warn);
        assert_eq!(classify_stderr("Fatal: cannot open db"), StderrLevel::Error);
        assert_eq!(classify_stderr("loading 12 tools"), StderrLevel::Info);
        assert!(is_benign_close_message("write |1: broken pipe"));
        assert!(!is_benign_close_message("connection refused"));
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let record = ServiceRecord {
            id: 9,
            name: "Ghost".into(),
            slug: "ghost".into(),
            transport: TransportConfig::Stdio {
                command: "/nonexistent/mcp-server-binary".into(),
                args: vec![],
                cwd: None,
                env: BTreeMap::new(),
            },
            enabled: true,
            health: HealthState::Unknown,
            install: None,
        };
        match spawn_stdio(&record, ConnectionOptions::default()) {
            Err(GatewayError::SpawnError { service, .. }) => assert_eq!(service, "ghost"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[cfg(unix)]
    mod child {
        use super::*;
        use crate::adapter::launcher::{Launcher, TransportLauncher};
        use crate::jsonrpc::Frame;
        use crate::models::AdapterState;
        use serde_json::json;

        /// Minimal line-oriented JSON-RPC server in plain sh.
        const RESPONDER: &str = r#"
echo "responder running on stdio" >&2
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"sh-responder","version":"1"}}}\n' "$id" ;;
    *'"name":"pid"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"pid":%s}}\n' "$id" "$$" ;;
    *'"name":"hang"'*) ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id" ;;
  esac
done
"#;

        async fn launch() -> Arc<Connection> {
            let record = ServiceRecord {
                id: 3,
                name: "Responder".into(),
                slug: "responder".into(),
                transport: TransportConfig::Stdio {
                    command: "sh".into(),
                    args: vec!["-c".into(), RESPONDER.into()],
                    cwd: None,
                    env: BTreeMap::new(),
                },
                enabled: true,
                health: HealthState::Unknown,
                install: None,
            };
            let launcher = TransportLauncher::new(
                reqwest::Client::new(),
                ConnectionOptions::default(),
                Duration::from_secs(5),
            );
            launcher.launch(&record).await.unwrap()
        }

        fn tool(id: &str, name: &str) -> Frame {
            Frame::request(json!(id), "tools/call", Some(json!({ "name": name })))
        }

        async fn pid_of(conn: &Arc<Connection>) -> u32 {
            let response = conn.call(tool("pid", "pid")).await.unwrap();
            response.result_value().unwrap()["pid"].as_u64().unwrap() as u32
        }

        /// `kill -0` succeeds while the pid exists, zombies included.
        fn exists(pid: u32) -> bool {
            std::process::Command::new("kill")
                .args(["-0", &pid.to_string()])
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        }

        async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
            for _ in 0..250 {
                if check() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            check()
        }

        #[tokio::test]
        async fn initialize_and_call_round_trip() {
            let conn = launch().await;
            assert_eq!(conn.state(), AdapterState::Running);

            let init = Frame::request(json!("client-init"), "initialize", Some(json!({})));
            let cached = conn.call(init).await.unwrap();
            assert_eq!(cached.id(), Some(&json!("client-init")));
            assert_eq!(cached.result_value().unwrap()["serverInfo"]["name"], "sh-responder");

            let response = conn.call(tool("abc", "echo")).await.unwrap();
            assert_eq!(response.id(), Some(&json!("abc")));
            assert_eq!(response.result_value().unwrap()["ok"], true);
            assert_eq!(conn.pending_count(), 0);
        }

        #[tokio::test]
        async fn killed_child_fails_the_call_in_flight() {
            let conn = launch().await;
            let pid = pid_of(&conn).await;

            let pending = tokio::spawn({
                let conn = conn.clone();
                async move { conn.call(tool("stuck", "hang")).await }
            });
            assert!(wait_until(|| conn.pending_count() == 1).await);

            let killed = std::process::Command::new("kill")
                .args(["-9", &pid.to_string()])
                .status()
                .unwrap();
            assert!(killed.success());

            let err = tokio::time::timeout(Duration::from_secs(5), pending)
                .await
                .unwrap()
                .unwrap()
                .unwrap_err();
            assert!(matches!(err, GatewayError::UpstreamCrashed { .. }));
            assert_eq!(conn.wait_terminal().await, AdapterState::Crashed);
        }

        #[tokio::test]
        async fn close_kills_and_reaps_the_child() {
            let conn = launch().await;
            let pid = pid_of(&conn).await;
            assert!(exists(pid));

            conn.close(GatewayError::ServiceDisabled {
                service: "responder".into(),
            });
            assert_eq!(conn.wait_terminal().await, AdapterState::Stopped);
            assert!(wait_until(|| !exists(pid)).await, "child {pid} still present");
        }
    }
}
