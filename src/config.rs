// MCP Gateway - configuration
// Runtime knobs from the environment (optionally seeded from `.env`) and the
// injected ServiceRecord snapshot.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::models::ServiceRecord;

/// When stdio services are spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupStrategy {
    /// Spawn every enabled stdio service at startup; probes spawn missing adapters.
    #[default]
    Eager,
    /// Spawn on the first proxied request; probes skip services that are not running.
    OnDemand,
}

impl FromStr for StartupStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eager" => Ok(StartupStrategy::Eager),
            "on_demand" | "on-demand" | "lazy" => Ok(StartupStrategy::OnDemand),
            other => Err(format!("unknown startup strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub auth_secret: Option<String>,
    pub services_file: Option<PathBuf>,
    pub call_timeout: Duration,
    pub init_timeout: Duration,
    pub restart_base: Duration,
    pub restart_cap: Duration,
    pub restart_max_crashes: usize,
    pub restart_window: Duration,
    pub health_interval: Duration,
    pub health_jitter: Duration,
    pub health_probe_timeout: Duration,
    pub session_queue_capacity: usize,
    pub flow_control_grace: Duration,
    pub startup_strategy: StartupStrategy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8090,
            auth_secret: None,
            services_file: None,
            call_timeout: Duration::from_secs(30),
            init_timeout: Duration::from_secs(30),
            restart_base: Duration::from_secs(1),
            restart_cap: Duration::from_secs(30),
            restart_max_crashes: 5,
            restart_window: Duration::from_secs(60),
            health_interval: Duration::from_secs(60),
            health_jitter: Duration::from_secs(5),
            health_probe_timeout: Duration::from_secs(10),
            session_queue_capacity: 256,
            flow_control_grace: Duration::from_secs(5),
            startup_strategy: StartupStrategy::Eager,
        }
    }
}

impl GatewayConfig {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Unparseable values fall
    /// back to the default with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let millis = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_millis() as u64).map_or(default, Duration::from_millis)
        };
        let secs = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_secs()).map_or(default, Duration::from_secs)
        };

        Self {
            port: parse_or(&lookup, "PORT", d.port).unwrap_or(d.port),
            auth_secret: lookup("AUTH_SECRET").filter(|s| !s.is_empty()),
            services_file: lookup("MCP_SERVICES_FILE")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            call_timeout: millis("GATEWAY_CALL_TIMEOUT_MS", d.call_timeout),
            init_timeout: millis("GATEWAY_INIT_TIMEOUT_MS", d.init_timeout),
            restart_base: millis("RESTART_BASE_MS", d.restart_base),
            restart_cap: millis("RESTART_CAP_MS", d.restart_cap),
            restart_max_crashes: parse_or(&lookup, "RESTART_MAX_CRASHES", d.restart_max_crashes)
                .unwrap_or(d.restart_max_crashes),
            restart_window: secs("RESTART_WINDOW_SECS", d.restart_window),
            health_interval: secs("HEALTH_INTERVAL_SECS", d.health_interval),
            health_jitter: millis("HEALTH_JITTER_MS", d.health_jitter),
            health_probe_timeout: millis("HEALTH_PROBE_TIMEOUT_MS", d.health_probe_timeout),
            session_queue_capacity: parse_or(
                &lookup,
                "SESSION_QUEUE_CAPACITY",
                d.session_queue_capacity,
            )
            .unwrap_or(d.session_queue_capacity)
            .max(1),
            flow_control_grace: millis("FLOW_CONTROL_GRACE_MS", d.flow_control_grace),
            startup_strategy: parse_or(&lookup, "STDIO_STARTUP_STRATEGY", d.startup_strategy)
                .unwrap_or(d.startup_strategy),
        }
    }
}

/// `Some(default)` when unset, `Some(parsed)` when valid, `None` (logged) when invalid.
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Some(default),
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!("config: ignoring invalid {}={:?}, using default", key, raw);
                None
            }
        },
    }
}

// ── Services snapshot ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ServicesSnapshot {
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to read services snapshot {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse services snapshot {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn load_snapshot(path: &Path) -> Result<Vec<ServiceRecord>, SnapshotError> {
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| SnapshotError::Io {
        path: display.clone(),
        source,
    })?;
    let snapshot: ServicesSnapshot =
        serde_json::from_str(&text).map_err(|source| SnapshotError::Parse {
            path: display,
            source,
        })?;
    Ok(snapshot.services)
}
