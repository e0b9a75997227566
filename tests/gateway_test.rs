// Behavioural tests of the gateway core (registry, pool, router, sessions,
// health) against in-process fake MCP servers.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::StreamExt;
use serde_json::{json, Value};

use common::*;
use mcp_gateway::config::StartupStrategy;
use mcp_gateway::error::GatewayError;
use mcp_gateway::jsonrpc::Frame;
use mcp_gateway::models::{AdapterState, HealthState};

fn frame(value: Value) -> Frame {
    Frame::from_value(value).unwrap()
}

// ── Spawning ───────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_first_requests_spawn_one_adapter() {
    let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    behavior.launch_delay_ms.store(50, Ordering::SeqCst);
    let record = state.registry.get("files").unwrap();

    let calls = (0..50).map(|i| {
        let router = state.router.clone();
        let record = record.clone();
        async move { router.call(&record, frame(tool_call(json!(i), "echo"))).await }
    });
    let results = join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        let response = result.expect("call should succeed");
        assert_eq!(response.id(), Some(&json!(i)));
    }
    assert_eq!(behavior.launches(), 1);
    assert_eq!(state.pool.launches(), 1);
    assert_eq!(state.pool.live_count(), 1);
    assert_eq!(state.registry.get("files").unwrap().health, HealthState::Healthy);
}

#[tokio::test]
async fn interleaved_calls_get_their_own_responses() {
    let (state, _behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();

    let calls = (0..20).map(|i| {
        let router = state.router.clone();
        let record = record.clone();
        async move {
            let request = json!({
                "jsonrpc": "2.0",
                "id": format!("req-{i}"),
                "method": "tools/call",
                "params": { "name": "echo", "arguments": { "n": i } }
            });
            router.call(&record, frame(request)).await.unwrap()
        }
    });
    for (i, response) in join_all(calls).await.into_iter().enumerate() {
        assert_eq!(response.id(), Some(&json!(format!("req-{i}"))));
        assert_eq!(response.result_value().unwrap()["echo"]["n"], json!(i));
    }
}

#[tokio::test]
async fn initialize_is_answered_from_the_shared_handshake() {
    let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();

    for id in ["a", "b"] {
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": { "protocolVersion": "2024-11-05", "capabilities": {} }
        });
        let response = state.router.call(&record, frame(request)).await.unwrap();
        assert_eq!(response.id(), Some(&json!(id)));
        assert_eq!(response.result_value().unwrap()["serverInfo"]["name"], "fake");
    }
    state
        .router
        .notify(&record, &frame(json!({"jsonrpc": "2.0", "method": "notifications/initialized"})))
        .await
        .unwrap();

    let received = behavior.received.lock().unwrap().clone();
    let count = |m: &str| received.iter().filter(|v| v["method"] == m).count();
    assert_eq!(count("initialize"), 1);
    assert_eq!(count("notifications/initialized"), 1);
}

#[tokio::test]
async fn spawn_failure_marks_unhealthy_without_leaking_reason() {
    let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    behavior.fail_launch.store(true, Ordering::SeqCst);
    let record = state.registry.get("files").unwrap();

    let err = state
        .router
        .call(&record, frame(tool_call(json!(1), "echo")))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::SpawnError { .. }));
    assert!(!err.sanitized_message().contains("os error"));
    assert_eq!(state.registry.get("files").unwrap().health, HealthState::Unhealthy);
    assert!(matches!(
        state.router.resolve("files"),
        Err(GatewayError::ServiceUnavailable { .. })
    ));
}

// ── Streaming and correlation ──────────────────────────────────────

#[tokio::test]
async fn progress_frames_arrive_in_order_before_the_result() {
    let (state, _behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();

    let frames: Vec<Frame> = state
        .router
        .stream(&record, frame(tool_call(json!("call-1"), "stream")))
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(frames.len(), 6);
    for (step, progress) in frames[..5].iter().enumerate() {
        assert_eq!(progress.method(), Some("notifications/progress"));
        assert_eq!(progress.params().unwrap()["progress"], json!(step + 1));
    }
    let last = &frames[5];
    assert!(last.is_response());
    assert_eq!(last.id(), Some(&json!("call-1")));
}

#[tokio::test]
async fn client_progress_token_is_restored() {
    let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();

    let request = json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "tools/call",
        "params": { "name": "stream", "_meta": { "progressToken": "mine" } }
    });
    let frames: Vec<Frame> = state
        .router
        .stream(&record, frame(request))
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert!(frames[..5].iter().all(|f| f.progress_token() == Some(&json!("mine"))));
    // The upstream saw the gateway's own token, not the client's.
    let received = behavior.received.lock().unwrap().clone();
    let upstream = received.iter().find(|v| v["method"] == "tools/call").unwrap();
    assert_ne!(upstream["params"]["_meta"]["progressToken"], json!("mine"));
}

#[tokio::test]
async fn timed_out_call_releases_its_slot_and_cancels_upstream() {
    let mut config = test_config();
    config.call_timeout = Duration::from_millis(200);
    let (state, behavior) = fake_state(config, vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();

    let err = state
        .router
        .call(&record, frame(tool_call(json!(1), "hang")))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::GatewayTimeout { timeout_ms: 200, .. }));

    let conn = state.pool.live(1).unwrap();
    assert_eq!(conn.pending_count(), 0);
    assert!(eventually(Duration::from_secs(2), || behavior.cancelled().len() == 1).await);

    // The adapter stays usable.
    let ok = state.router.call(&record, frame(tool_call(json!(2), "echo"))).await;
    assert!(ok.is_ok());
}

#[tokio::test]
async fn stalled_stream_does_not_hold_up_other_calls() {
    let mut config = test_config();
    config.session_queue_capacity = 1;
    let (state, behavior) = fake_state(config, vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();

    // Opened but never polled: its one-frame slot fills on the first progress frame.
    let mut stalled = state
        .router
        .stream(&record, frame(tool_call(json!("slow"), "stream")))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let response = tokio::time::timeout(
        Duration::from_millis(500),
        state.router.call(&record, frame(tool_call(json!("fast"), "echo"))),
    )
    .await
    .expect("unrelated call answered while the stream is stalled")
    .unwrap();
    assert_eq!(response.id(), Some(&json!("fast")));
    assert!(started.elapsed() < Duration::from_millis(500));

    let first = stalled.next().await.unwrap().unwrap();
    assert_eq!(first.method(), Some("notifications/progress"));
    let err = stalled.next().await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::FlowControlOverflow { .. }));
    assert!(stalled.next().await.is_none());

    assert_eq!(state.pool.live(1).unwrap().pending_count(), 0);
    assert!(eventually(Duration::from_secs(2), || behavior.cancelled().len() == 1).await);
}

#[tokio::test]
async fn malformed_lines_do_not_kill_the_adapter() {
    let (state, _behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();

    let response = state
        .router
        .call(&record, frame(tool_call(json!(1), "garbage")))
        .await
        .unwrap();
    assert_eq!(response.result_value().unwrap()["after"], "garbage");
    let conn = state.pool.live(1).unwrap();
    assert!(conn.is_alive());
    assert!(eventually(Duration::from_secs(1), || conn.state() == AdapterState::Running).await);
}

// ── Crash supervision ──────────────────────────────────────────────

#[tokio::test]
async fn crashed_adapter_is_respawned_then_stopped_at_the_ceiling() {
    let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);

    for crash in 1..=3 {
        if crash > 1 {
            assert!(
                eventually(Duration::from_secs(2), || {
                    state.pool.live(1).is_some()
                        && state.registry.get("files").unwrap().health == HealthState::Healthy
                })
                .await,
                "adapter should be back before crash {crash}"
            );
        }
        let record = state.registry.get("files").unwrap();
        let err = state
            .router
            .call(&record, frame(tool_call(json!(crash), "crash")))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamCrashed { .. }), "got {err:?}");
    }

    assert!(eventually(Duration::from_secs(2), || state.pool.is_stopped(1)).await);
    assert_eq!(state.registry.get("files").unwrap().health, HealthState::Stopped);
    assert_eq!(behavior.launches(), 3);
    assert!(matches!(
        state.router.resolve("files"),
        Err(GatewayError::ServiceUnavailable { .. })
    ));

    // No further respawns once stopped.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(behavior.launches(), 3);

    // An admin restart clears the ceiling.
    let conn = state.pool.restart(1).await.unwrap();
    assert_eq!(conn.state(), AdapterState::Running);
    assert_eq!(state.pool.crash_count(1), 0);
    assert_eq!(state.registry.get("files").unwrap().health, HealthState::Healthy);
}

#[tokio::test]
async fn idempotent_call_retries_once_after_crash() {
    let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();
    let conn = state.pool.get_or_spawn(&record).await.unwrap();
    behavior.ping_delay_ms.store(100, Ordering::SeqCst);

    // Kill the adapter underneath a pending ping.
    let router = state.router.clone();
    let rec = record.clone();
    let ping = json!({"jsonrpc": "2.0", "id": "p", "method": "ping"});
    let pending = tokio::spawn(async move { router.call(&rec, frame(ping)).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    conn.crash("killed by test");

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.id(), Some(&json!("p")));
    assert!(response.error_value().is_none());
    assert_eq!(behavior.launches(), 2);
    assert_eq!(behavior.pings.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retried_adapter_stays_admitted_after_the_old_crash_is_handled() {
    for _ in 0..10 {
        let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
        let record = state.registry.get("files").unwrap();
        let old = state.pool.get_or_spawn(&record).await.unwrap();
        behavior.ping_delay_ms.store(100, Ordering::SeqCst);

        let router = state.router.clone();
        let rec = record.clone();
        let ping = json!({"jsonrpc": "2.0", "id": "p", "method": "ping"});
        let pending = tokio::spawn(async move { router.call(&rec, frame(ping)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        old.crash("killed by test");
        pending.await.unwrap().unwrap();

        // Let the old adapter's watcher run before looking at health.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let live = state.pool.live(1).expect("replacement adapter is live");
        assert!(!std::sync::Arc::ptr_eq(&live, &old));
        assert_eq!(state.registry.get("files").unwrap().health, HealthState::Healthy);
        assert!(state.router.resolve("files").is_ok());
    }
}

#[tokio::test]
async fn non_idempotent_call_is_not_retried() {
    let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();
    let conn = state.pool.get_or_spawn(&record).await.unwrap();

    let router = state.router.clone();
    let rec = record.clone();
    let pending =
        tokio::spawn(async move { router.call(&rec, frame(tool_call(json!(1), "hang"))).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    conn.crash("killed by test");

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::UpstreamCrashed { .. }));
    let received = behavior.received.lock().unwrap().clone();
    assert_eq!(received.iter().filter(|v| v["method"] == "tools/call").count(), 1);
}

// ── Sessions ───────────────────────────────────────────────────────

#[tokio::test]
async fn disabling_a_service_terminates_all_its_sessions() {
    let (state, _behavior) = fake_state(
        test_config(),
        vec![stdio_record(1, "files"), stdio_record(2, "other")],
    );
    let files = state.registry.get("files").unwrap();
    let other = state.registry.get("other").unwrap();

    let mut sessions = Vec::new();
    for _ in 0..5 {
        let conn = state.router.connect(&files).await.unwrap();
        let (session, rx) = state.sessions.open(&files, CALLER);
        session.attach(conn);
        sessions.push((session, rx));
    }
    let conn = state.router.connect(&other).await.unwrap();
    let (survivor, _rx) = state.sessions.open(&other, CALLER);
    survivor.attach(conn);

    state.registry.set_enabled(1, false).unwrap();

    for (session, _) in &sessions {
        assert!(session.is_closed());
        assert!(matches!(
            session.close_reason(),
            Some(GatewayError::ServiceDisabled { .. })
        ));
    }
    assert_eq!(state.sessions.count_for(1), 0);
    assert!(state.pool.live(1).is_none());
    assert!(!survivor.is_closed());
    assert!(matches!(
        state.router.resolve("files"),
        Err(GatewayError::ServiceDisabled { .. })
    ));
    assert_eq!(state.registry.get("files").unwrap().health, HealthState::Stopped);
}

#[tokio::test]
async fn session_receives_responses_and_broadcasts() {
    let (state, _behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();
    let conn = state.router.connect(&record).await.unwrap();
    let (session, mut rx) = state.sessions.open(&record, CALLER);
    session.attach(conn);

    state
        .router
        .dispatch_to_session(record.clone(), session.clone(), frame(tool_call(json!(9), "broadcast")));

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame in time")
            .expect("session open");
        seen.push(next);
    }
    assert!(seen.iter().any(|f| f.method() == Some("notifications/message")));
    assert!(seen.iter().any(|f| f.is_response() && f.id() == Some(&json!(9))));
}

#[tokio::test]
async fn session_errors_arrive_as_jsonrpc_error_frames() {
    let mut config = test_config();
    config.call_timeout = Duration::from_millis(150);
    let (state, _behavior) = fake_state(config, vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();
    let conn = state.router.connect(&record).await.unwrap();
    let (session, mut rx) = state.sessions.open(&record, CALLER);
    session.attach(conn);

    state
        .router
        .dispatch_to_session(record.clone(), session.clone(), frame(tool_call(json!("slow"), "hang")));

    let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.id(), Some(&json!("slow")));
    let error = reply.error_value().unwrap();
    assert_eq!(error["data"]["kind"], "GatewayTimeout");
    assert!(eventually(Duration::from_secs(1), || session.in_flight() == 0).await);
}

// ── Health ─────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_probes_degrade_then_mark_unhealthy_and_recover() {
    let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();
    state.pool.get_or_spawn(&record).await.unwrap();
    behavior.fail_ping.store(true, Ordering::SeqCst);

    let mut statuses = Vec::new();
    for _ in 0..4 {
        statuses.push(state.health.trigger(1).await.unwrap().status);
    }
    assert_eq!(
        statuses,
        vec![
            HealthState::Healthy,
            HealthState::Healthy,
            HealthState::Degraded,
            HealthState::Unhealthy
        ]
    );
    let report = state.health.get_health(1).unwrap();
    assert_eq!(report.consecutive_failures, 4);
    assert_eq!(report.warning_level, 2);
    assert_eq!(report.failure_count, 4);

    behavior.fail_ping.store(false, Ordering::SeqCst);
    let report = state.health.trigger(1).await.unwrap();
    assert_eq!(report.status, HealthState::Healthy);
    assert_eq!(report.consecutive_failures, 0);
    assert_eq!(report.warning_level, 0);
    assert!(report.last_checked.is_some());
}

#[tokio::test]
async fn overlapping_health_checks_share_one_probe() {
    let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();
    state.pool.get_or_spawn(&record).await.unwrap();
    behavior.ping_delay_ms.store(200, Ordering::SeqCst);

    let checks = (0..10).map(|_| {
        let health = state.health.clone();
        async move { health.trigger(1).await.unwrap() }
    });
    let reports = join_all(checks).await;

    assert!(reports.iter().all(|r| r.status == HealthState::Healthy));
    assert_eq!(behavior.pings.load(Ordering::SeqCst), 1);

    // A later check probes again.
    state.health.trigger(1).await.unwrap();
    assert_eq!(behavior.pings.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn on_demand_services_are_not_spawned_by_probes() {
    let (state, behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);

    let report = state.health.trigger(1).await.unwrap();
    assert_eq!(report.status, HealthState::Unknown);
    assert_eq!(behavior.launches(), 0);
}

#[tokio::test]
async fn eager_strategy_launches_at_startup() {
    let mut config = test_config();
    config.startup_strategy = StartupStrategy::Eager;
    let (state, behavior) = fake_state(
        config,
        vec![stdio_record(1, "files"), http_record(2, "web", "http://127.0.0.1:9")],
    );

    state.start_services().await;
    assert_eq!(behavior.launches(), 1);
    assert!(state.pool.live(1).is_some());
    assert!(state.pool.live(2).is_none());
}

#[tokio::test]
async fn shutdown_closes_sessions_and_adapters() {
    let (state, _behavior) = fake_state(test_config(), vec![stdio_record(1, "files")]);
    let record = state.registry.get("files").unwrap();
    let conn = state.router.connect(&record).await.unwrap();
    let (session, _rx) = state.sessions.open(&record, CALLER);
    session.attach(conn.clone());

    state.shutdown();

    assert!(session.is_closed());
    assert_eq!(state.sessions.count(), 0);
    assert!(eventually(Duration::from_secs(1), || conn.state() == AdapterState::Stopped).await);
    assert!(state.pool.live(1).is_none());
}
