// MCP Gateway - health supervisor
//
// Probes every enabled service on a fixed interval (with per-service jitter)
// and on demand. Probes go through the same adapter path as real traffic:
// a JSON-RPC `ping` for bridged services, a plain GET for HTTP services.
// Overlapping probes of one service collapse into a single in-flight probe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::Connection;
use crate::config::{GatewayConfig, StartupStrategy};
use crate::error::GatewayError;
use crate::jsonrpc::{self, Frame};
use crate::models::{warning_level, HealthState, ServiceHealth, TransportConfig};
use crate::pool::AdapterPool;
use crate::registry::ServiceRegistry;
use crate::session::SessionHub;

/// Consecutive failed probes that turn `Healthy` into `Degraded`.
pub const DEGRADED_AFTER: u32 = 3;

/// JSON-RPC "method not found": the server is alive but has no `ping`.
const METHOD_NOT_FOUND: i64 = -32601;

// ── State machine ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HealthTracker {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_checked: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl HealthTracker {
    pub fn new(state: HealthState) -> Self {
        Self {
            state,
            consecutive_failures: 0,
            success_count: 0,
            failure_count: 0,
            last_checked: None,
            response_time_ms: None,
            error_message: None,
        }
    }

    pub fn record_success(&mut self, elapsed: Duration) -> HealthState {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.last_checked = Some(Utc::now());
        self.response_time_ms = Some(elapsed.as_millis() as u64);
        self.error_message = None;
        self.state = HealthState::Healthy;
        self.state
    }

    /// A fatal failure (crash, launch failure) goes straight to `Unhealthy`.
    pub fn record_failure(&mut self, error: &str, fatal: bool) -> HealthState {
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.last_checked = Some(Utc::now());
        self.response_time_ms = None;
        self.error_message = Some(error.to_string());
        self.state = if fatal {
            HealthState::Unhealthy
        } else {
            match self.state {
                HealthState::Degraded | HealthState::Unhealthy => HealthState::Unhealthy,
                _ if self.consecutive_failures >= DEGRADED_AFTER => HealthState::Degraded,
                other => other,
            }
        };
        self.state
    }
}

// ── Supervisor ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub interval: Duration,
    pub jitter: Duration,
    pub probe_timeout: Duration,
    pub strategy: StartupStrategy,
}

impl From<&GatewayConfig> for SupervisorSettings {
    fn from(cfg: &GatewayConfig) -> Self {
        Self {
            interval: cfg.health_interval,
            jitter: cfg.health_jitter,
            probe_timeout: cfg.health_probe_timeout,
            strategy: cfg.startup_strategy,
        }
    }
}

enum ProbeOutcome {
    Alive,
    Failed { error: String, fatal: bool },
    /// Nothing to probe (on-demand service that is not running).
    Skipped,
}

type ProbeFuture = Shared<BoxFuture<'static, ServiceHealth>>;

pub struct HealthSupervisor {
    registry: Arc<ServiceRegistry>,
    pool: Arc<AdapterPool>,
    sessions: Arc<SessionHub>,
    client: reqwest::Client,
    settings: SupervisorSettings,
    trackers: Mutex<HashMap<i64, HealthTracker>>,
    inflight: Mutex<HashMap<i64, ProbeFuture>>,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        pool: Arc<AdapterPool>,
        sessions: Arc<SessionHub>,
        client: reqwest::Client,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pool,
            sessions,
            client,
            settings,
            trackers: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Starts the periodic probe loop; it exits when `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                "health: started (interval={}s, jitter={}ms)",
                supervisor.settings.interval.as_secs(),
                supervisor.settings.jitter.as_millis()
            );
            let mut ticker = tokio::time::interval(supervisor.settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; give services time to start.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                supervisor.probe_cycle(&shutdown);
            }
            tracing::info!("health: stopped");
        })
    }

    fn probe_cycle(self: &Arc<Self>, shutdown: &CancellationToken) {
        let mut scheduled = 0usize;
        for record in self.registry.list() {
            if !record.enabled || record.health == HealthState::Stopped {
                continue;
            }
            let delay = self.jitter();
            let supervisor = self.clone();
            let shutdown = shutdown.clone();
            let id = record.id;
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let _ = supervisor.trigger(id).await;
            });
            scheduled += 1;
        }
        tracing::debug!("health: scheduled {} probe(s)", scheduled);
    }

    fn jitter(&self) -> Duration {
        let max = self.settings.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Probes a service now. Calls that overlap an in-flight probe of the
    /// same service wait for that probe instead of starting another.
    pub async fn trigger(self: &Arc<Self>, id: i64) -> Result<ServiceHealth, GatewayError> {
        if self.registry.get_by_id(id).is_none() {
            return Err(GatewayError::ServiceNotFound {
                service: id.to_string(),
            });
        }
        let probe = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            match inflight.get(&id) {
                Some(probe) => probe.clone(),
                None => {
                    let supervisor = self.clone();
                    let probe = async move {
                        let report = supervisor.probe(id).await;
                        supervisor
                            .inflight
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .remove(&id);
                        report
                    }
                    .boxed()
                    .shared();
                    inflight.insert(id, probe.clone());
                    probe
                }
            }
        };
        Ok(probe.await)
    }

    /// Current health report without probing.
    pub fn get_health(&self, id: i64) -> Result<ServiceHealth, GatewayError> {
        if self.registry.get_by_id(id).is_none() {
            return Err(GatewayError::ServiceNotFound {
                service: id.to_string(),
            });
        }
        Ok(self.report(id))
    }

    fn report(&self, id: i64) -> ServiceHealth {
        let status = self
            .registry
            .get_by_id(id)
            .map_or(HealthState::Unknown, |r| r.health);
        let tracker = self
            .trackers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
            .unwrap_or_else(|| HealthTracker::new(status));
        ServiceHealth {
            service_id: id,
            status,
            adapter_state: self.pool.live(id).map(|c| c.state()),
            last_checked: tracker.last_checked,
            response_time_ms: tracker.response_time_ms,
            error_message: tracker.error_message,
            success_count: tracker.success_count,
            failure_count: tracker.failure_count,
            consecutive_failures: tracker.consecutive_failures,
            warning_level: warning_level(tracker.consecutive_failures),
            restarts_in_window: self.pool.crash_count(id),
            active_sessions: self.sessions.count_for(id),
        }
    }

    async fn probe(self: &Arc<Self>, id: i64) -> ServiceHealth {
        let Some(record) = self.registry.get_by_id(id) else {
            return self.report(id);
        };
        if !record.enabled || self.pool.is_stopped(id) {
            return self.report(id);
        }

        let started = Instant::now();
        let (outcome, conn) = match &record.transport {
            TransportConfig::Http { url } => (self.probe_http(url).await, None),
            _ => {
                let conn = match self.pool.live(id) {
                    Some(conn) => Some(conn),
                    None if self.settings.strategy == StartupStrategy::Eager
                        || record.health == HealthState::Unhealthy =>
                    {
                        match tokio::time::timeout(
                            self.settings.probe_timeout,
                            self.pool.get_or_spawn(&record),
                        )
                        .await
                        {
                            Ok(Ok(conn)) => Some(conn),
                            Ok(Err(e)) => {
                                let outcome = failed(&e);
                                return self.apply(id, outcome, started.elapsed(), None);
                            }
                            Err(_) => {
                                let outcome = ProbeOutcome::Failed {
                                    error: "launch timed out".into(),
                                    fatal: false,
                                };
                                return self.apply(id, outcome, started.elapsed(), None);
                            }
                        }
                    }
                    None => None,
                };
                match conn {
                    Some(conn) => (self.ping(&conn).await, Some(conn)),
                    None => (ProbeOutcome::Skipped, None),
                }
            }
        };
        self.apply(id, outcome, started.elapsed(), conn)
    }

    async fn ping(&self, conn: &Arc<Connection>) -> ProbeOutcome {
        let request = Frame::request(json!(format!("probe-{}", Uuid::new_v4())), jsonrpc::METHOD_PING, None);
        match tokio::time::timeout(self.settings.probe_timeout, conn.call(request)).await {
            Err(_) => ProbeOutcome::Failed {
                error: format!("ping timed out after {}ms", self.settings.probe_timeout.as_millis()),
                fatal: false,
            },
            Ok(Err(e)) => failed(&e),
            Ok(Ok(response)) => match response.error_value() {
                None => ProbeOutcome::Alive,
                Some(err) if err.get("code").and_then(|c| c.as_i64()) == Some(METHOD_NOT_FOUND) => {
                    ProbeOutcome::Alive
                }
                Some(err) => ProbeOutcome::Failed {
                    error: format!("ping returned error: {err}"),
                    fatal: false,
                },
            },
        }
    }

    async fn probe_http(&self, url: &str) -> ProbeOutcome {
        match tokio::time::timeout(self.settings.probe_timeout, self.client.get(url).send()).await {
            Err(_) => ProbeOutcome::Failed {
                error: "probe timed out".into(),
                fatal: false,
            },
            Ok(Err(e)) => ProbeOutcome::Failed {
                error: format!("probe failed: {e}"),
                fatal: false,
            },
            Ok(Ok(resp)) if resp.status().is_server_error() => ProbeOutcome::Failed {
                error: format!("upstream answered {}", resp.status()),
                fatal: false,
            },
            Ok(Ok(_)) => ProbeOutcome::Alive,
        }
    }

    fn apply(
        &self,
        id: i64,
        outcome: ProbeOutcome,
        elapsed: Duration,
        conn: Option<Arc<Connection>>,
    ) -> ServiceHealth {
        let Some(current) = self.registry.get_by_id(id).map(|r| r.health) else {
            return self.report(id);
        };
        let next = {
            let mut trackers = self.trackers.lock().unwrap_or_else(|p| p.into_inner());
            let tracker = trackers
                .entry(id)
                .or_insert_with(|| HealthTracker::new(current));
            // The pool writes health too (launches, crashes); start from the
            // registry's view.
            tracker.state = current;
            match &outcome {
                ProbeOutcome::Alive => tracker.record_success(elapsed),
                ProbeOutcome::Failed { error, fatal } => tracker.record_failure(error, *fatal),
                ProbeOutcome::Skipped => current,
            }
        };

        if let ProbeOutcome::Failed { error, .. } = &outcome {
            tracing::warn!(service_id = id, "health: probe failed: {}", error);
        }
        if next != current && self.registry.set_health(id, next) {
            tracing::info!(service_id = id, "health: {} -> {}", current, next);
        }
        if let Some(conn) = conn {
            match next {
                HealthState::Degraded => conn.mark_degraded(),
                HealthState::Healthy => conn.mark_running(),
                _ => {}
            }
        }
        self.report(id)
    }
}

fn failed(err: &GatewayError) -> ProbeOutcome {
    ProbeOutcome::Failed {
        error: err.to_string(),
        fatal: matches!(
            err,
            GatewayError::SpawnError { .. } | GatewayError::UpstreamCrashed { .. }
        ),
    }
}
