// MCP Gateway - application state
// Wires the registry, adapter pool, session hub, router and health supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::adapter::launcher::{Launcher, TransportLauncher};
use crate::adapter::restart::RestartPolicy;
use crate::adapter::ConnectionOptions;
use crate::config::{GatewayConfig, StartupStrategy};
use crate::error::GatewayError;
use crate::health::{HealthSupervisor, SupervisorSettings};
use crate::models::{ServiceRecord, TransportConfig};
use crate::pool::AdapterPool;
use crate::registry::{RegistryListener, ServiceRegistry};
use crate::router::GatewayRouter;
use crate::session::SessionHub;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub pool: Arc<AdapterPool>,
    pub sessions: Arc<SessionHub>,
    pub router: Arc<GatewayRouter>,
    pub health: Arc<HealthSupervisor>,
    pub shutdown: CancellationToken,
    pub start_time: Instant,
    ready: Arc<AtomicBool>,
}

pub fn connection_options(config: &GatewayConfig) -> ConnectionOptions {
    ConnectionOptions {
        slot_capacity: config.session_queue_capacity,
        ..ConnectionOptions::default()
    }
}

/// Shared outbound client. No overall timeout: upstream SSE sessions are
/// long-lived; per-call deadlines are applied by the router.
fn http_client() -> Client {
    Client::builder()
        .pool_max_idle_per_host(10)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("state: falling back to default HTTP client: {}", e);
            Client::new()
        })
}

impl AppState {
    pub fn new(config: GatewayConfig, records: Vec<ServiceRecord>) -> Self {
        let client = http_client();
        let launcher = Arc::new(TransportLauncher::new(
            client.clone(),
            connection_options(&config),
            config.init_timeout,
        ));
        Self::build(config, records, launcher, client)
    }

    /// Same wiring with a custom launcher (fake upstreams in tests).
    pub fn with_launcher(
        config: GatewayConfig,
        records: Vec<ServiceRecord>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self::build(config, records, launcher, http_client())
    }

    fn build(
        config: GatewayConfig,
        records: Vec<ServiceRecord>,
        launcher: Arc<dyn Launcher>,
        client: Client,
    ) -> Self {
        let registry = Arc::new(ServiceRegistry::from_records(records));
        // Registered first: adapters go down before their sessions are told.
        let pool = AdapterPool::new(registry.clone(), launcher, RestartPolicy::from(&config));
        let sessions = SessionHub::new(config.session_queue_capacity, config.flow_control_grace);
        let listener: Arc<dyn RegistryListener> = sessions.clone();
        registry.add_listener(Arc::downgrade(&listener));

        let router = GatewayRouter::new(
            registry.clone(),
            pool.clone(),
            client.clone(),
            config.call_timeout,
        );
        let health = HealthSupervisor::new(
            registry.clone(),
            pool.clone(),
            sessions.clone(),
            client,
            SupervisorSettings::from(&config),
        );

        tracing::info!("state: {} service(s) registered", registry.len());

        Self {
            config: Arc::new(config),
            registry,
            pool,
            sessions,
            router,
            health,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("state: gateway ready");
    }

    /// Launches every enabled bridged service when the strategy is eager.
    /// Failures are logged; the supervisor keeps retrying them.
    pub async fn start_services(&self) {
        if self.config.startup_strategy != StartupStrategy::Eager {
            return;
        }
        let launches = self
            .registry
            .list()
            .into_iter()
            .filter(|r| r.enabled && !matches!(r.transport, TransportConfig::Http { .. }))
            .map(|record| {
                let pool = self.pool.clone();
                async move {
                    let result: Result<_, GatewayError> = pool.get_or_spawn(&record).await;
                    if let Err(e) = result {
                        tracing::warn!(service = %record.slug, "state: eager start failed: {}", e);
                    }
                }
            });
        futures_util::future::join_all(launches).await;
    }

    /// Stops background work and tears down every session and adapter.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.sessions.close_all(GatewayError::ServiceUnavailable {
            service: "gateway".into(),
            reason: "gateway shutting down".into(),
        });
        self.pool.shutdown_all();
        tracing::info!("state: shutdown complete");
    }
}
