// MCP Gateway - adapter launcher
// Turns a ServiceRecord into a live, initialized Connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{process, Connection, ConnectionOptions};
use crate::bridge;
use crate::error::GatewayError;
use crate::models::{ServiceRecord, TransportConfig};

/// Seam between the pool and the concrete transports. Implementations return
/// a connection whose `initialize` handshake has completed.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, record: &ServiceRecord) -> Result<Arc<Connection>, GatewayError>;
}

/// Launches stdio children and upstream SSE sessions.
pub struct TransportLauncher {
    client: reqwest::Client,
    opts: ConnectionOptions,
    init_timeout: Duration,
}

impl TransportLauncher {
    pub fn new(client: reqwest::Client, opts: ConnectionOptions, init_timeout: Duration) -> Self {
        Self {
            client,
            opts,
            init_timeout,
        }
    }
}

#[async_trait]
impl Launcher for TransportLauncher {
    async fn launch(&self, record: &ServiceRecord) -> Result<Arc<Connection>, GatewayError> {
        let conn = match &record.transport {
            TransportConfig::Stdio { .. } => process::spawn_stdio(record, self.opts.clone())?,
            TransportConfig::Sse { url } => {
                bridge::sse::connect(
                    record.id,
                    &record.slug,
                    url,
                    &self.client,
                    self.opts.clone(),
                    self.init_timeout,
                )
                .await?
            }
            TransportConfig::Http { .. } => {
                return Err(GatewayError::BadRequest(format!(
                    "service '{}' is plain HTTP and has no adapter",
                    record.slug
                )));
            }
        };

        initialize(conn, &record.slug, self.init_timeout).await
    }
}

/// Runs the handshake; a connection that fails it is closed. Crashes during
/// the handshake surface as `SpawnError`.
pub async fn initialize(
    conn: Arc<Connection>,
    service: &str,
    timeout: Duration,
) -> Result<Arc<Connection>, GatewayError> {
    match conn.handshake(timeout).await {
        Ok(_) => Ok(conn),
        Err(err) => {
            let err = match err {
                GatewayError::UpstreamCrashed { reason, .. } => GatewayError::SpawnError {
                    service: service.to_string(),
                    reason: format!("exited during initialize: {reason}"),
                },
                other => other,
            };
            conn.close(err.clone());
            Err(err)
        }
    }
}
