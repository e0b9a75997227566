// MCP Gateway - data model
// Service records as injected by the management collaborator, plus the
// runtime health/adapter states and the health report DTO.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Service records
// ---------------------------------------------------------------------------

/// How the gateway talks to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Long-lived child process speaking line-delimited JSON-RPC on stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Upstream MCP server using the SSE transport (endpoint event + POST).
    Sse { url: String },
    /// Plain HTTP service, forwarded as-is.
    #[serde(alias = "streamable_http")]
    Http { url: String },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::Sse { .. } => TransportKind::Sse,
            TransportConfig::Http { .. } => TransportKind::Http,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    Http,
}

/// Install metadata owned by the package-market collaborator. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallInfo {
    #[serde(default)]
    pub package_manager: Option<String>,
    pub source_package: String,
    #[serde(default)]
    pub installed_version: Option<String>,
    #[serde(default)]
    pub installed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: i64,
    pub name: String,
    /// Routing key used in `/proxy/{slug}/...`. Derived from `name` when empty.
    #[serde(default)]
    pub slug: String,
    pub transport: TransportConfig,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub health: HealthState,
    #[serde(default)]
    pub install: Option<InstallInfo>,
}

fn default_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Health of a service as seen by the router when admitting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Unknown,
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Stopped,
}

impl HealthState {
    /// Whether the router refuses new requests in this state.
    pub fn refuses_traffic(self) -> bool {
        matches!(self, HealthState::Unhealthy | HealthState::Stopped)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Starting => "starting",
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one live adapter (child process or upstream connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Starting,
    Running,
    Degraded,
    Crashed,
    Stopped,
}

impl AdapterState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AdapterState::Crashed | AdapterState::Stopped)
    }
}

// ---------------------------------------------------------------------------
// Health report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_id: i64,
    pub status: HealthState,
    pub adapter_state: Option<AdapterState>,
    pub last_checked: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    /// 0 healthy, 1 up to 3 failures, 2 up to 10, 3 beyond.
    pub warning_level: u8,
    pub restarts_in_window: usize,
    pub active_sessions: usize,
}

pub fn warning_level(consecutive_failures: u32) -> u8 {
    match consecutive_failures {
        0 => 0,
        1..=3 => 1,
        4..=10 => 2,
        _ => 3,
    }
}

/// Row of `GET /api/services`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub health: HealthState,
    pub running: bool,
    pub install: Option<InstallInfo>,
}

impl ServiceSummary {
    pub fn new(record: &ServiceRecord, running: bool) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            slug: record.slug.clone(),
            transport: record.transport.kind(),
            enabled: record.enabled,
            health: record.health,
            running,
            install: record.install.clone(),
        }
    }
}

/// Body of `GET /api/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub status: String,
    pub version: String,
    pub app: String,
    pub uptime_seconds: u64,
    pub services: usize,
    pub live_adapters: usize,
    pub sessions: usize,
}
