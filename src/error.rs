// MCP Gateway - error kinds
// Every failure surfaced to clients, with HTTP status and JSON-RPC code mapping.

use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

/// Every failure the gateway can surface.
///
/// Transport faults (spawn failures, crashes, malformed frames) are translated
/// into these kinds at the adapter boundary; raw process or socket errors never
/// reach a client. Reasons carried by `SpawnError` / `UpstreamCrashed` are logged
/// server-side and replaced by a generic message in responses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("service not found: {service}")]
    ServiceNotFound { service: String },

    #[error("service is disabled: {service}")]
    ServiceDisabled { service: String },

    #[error("service unavailable: {service} ({reason})")]
    ServiceUnavailable { service: String, reason: String },

    #[error("failed to launch service '{service}': {reason}")]
    SpawnError { service: String, reason: String },

    #[error("upstream for '{service}' crashed: {reason}")]
    UpstreamCrashed { service: String, reason: String },

    #[error("call to '{service}' timed out after {timeout_ms}ms")]
    GatewayTimeout { service: String, timeout_ms: u64 },

    #[error("client for '{service}' fell behind the stream")]
    FlowControlOverflow { service: String },

    #[error("malformed frame from '{service}': {reason}")]
    MalformedUpstreamFrame { service: String, reason: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

impl GatewayError {
    /// Stable machine-readable kind, used as the `code` of client error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::ServiceNotFound { .. } => "ServiceNotFound",
            GatewayError::ServiceDisabled { .. } => "ServiceDisabled",
            GatewayError::ServiceUnavailable { .. } => "ServiceUnavailable",
            GatewayError::SpawnError { .. } => "SpawnError",
            GatewayError::UpstreamCrashed { .. } => "UpstreamCrashed",
            GatewayError::GatewayTimeout { .. } => "GatewayTimeout",
            GatewayError::FlowControlOverflow { .. } => "FlowControlOverflow",
            GatewayError::MalformedUpstreamFrame { .. } => "MalformedUpstreamFrame",
            GatewayError::BadRequest(_) => "BadRequest",
            GatewayError::SessionNotFound(_) => "SessionNotFound",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ServiceNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::ServiceDisabled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::SpawnError { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamCrashed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::FlowControlOverflow { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::MalformedUpstreamFrame { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// JSON-RPC error code used when the failure is delivered inside a stream.
    pub fn rpc_code(&self) -> i64 {
        match self {
            GatewayError::ServiceNotFound { .. } => -32001,
            GatewayError::ServiceDisabled { .. } => -32002,
            GatewayError::ServiceUnavailable { .. } => -32003,
            GatewayError::SpawnError { .. } => -32004,
            GatewayError::UpstreamCrashed { .. } => -32005,
            GatewayError::GatewayTimeout { .. } => -32006,
            GatewayError::FlowControlOverflow { .. } => -32007,
            GatewayError::MalformedUpstreamFrame { .. } => -32000,
            GatewayError::BadRequest(_) => -32600,
            GatewayError::SessionNotFound(_) => -32600,
        }
    }

    /// Message safe to show to clients. Never includes OS errors, exit
    /// statuses or anything else read from the child process.
    pub fn sanitized_message(&self) -> String {
        match self {
            GatewayError::SpawnError { service, .. } => {
                format!("service '{service}' could not be started")
            }
            GatewayError::UpstreamCrashed { service, .. } => {
                format!("service '{service}' terminated unexpectedly")
            }
            GatewayError::MalformedUpstreamFrame { service, .. } => {
                format!("service '{service}' produced an invalid response")
            }
            GatewayError::ServiceUnavailable { service, .. } => {
                format!("service '{service}' is currently unavailable")
            }
            other => other.to_string(),
        }
    }

    /// The service the error refers to, when there is one.
    pub fn service(&self) -> Option<&str> {
        match self {
            GatewayError::ServiceNotFound { service }
            | GatewayError::ServiceDisabled { service }
            | GatewayError::ServiceUnavailable { service, .. }
            | GatewayError::SpawnError { service, .. }
            | GatewayError::UpstreamCrashed { service, .. }
            | GatewayError::GatewayTimeout { service, .. }
            | GatewayError::FlowControlOverflow { service }
            | GatewayError::MalformedUpstreamFrame { service, .. } => Some(service),
            GatewayError::BadRequest(_) | GatewayError::SessionNotFound(_) => None,
        }
    }
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::warn!(code = self.kind(), "gateway error ({}): {}", status.as_u16(), self);
        } else {
            tracing::debug!(code = self.kind(), "gateway error ({}): {}", status.as_u16(), self);
        }

        let body = json!({
            "success": false,
            "error": {
                "code": self.kind(),
                "message": self.sanitized_message(),
            }
        });
        (status, Json(body)).into_response()
    }
}
