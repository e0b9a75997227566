// ---------------------------------------------------------------------------
// handlers/system.rs - Gateway health and readiness (public, no auth)
// ---------------------------------------------------------------------------

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::models::GatewayHealth;
use crate::state::AppState;

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<GatewayHealth> {
    Json(GatewayHealth {
        status: if state.is_ready() { "ok" } else { "starting" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        app: "mcp-gateway".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        services: state.registry.len(),
        live_adapters: state.pool.live_count(),
        sessions: state.sessions.count(),
    })
}

/// GET /api/health/ready - lightweight readiness probe (no locks held across awaits).
pub async fn readiness(State(state): State<AppState>) -> axum::response::Response {
    let ready = state.is_ready();
    let uptime = state.start_time.elapsed().as_secs();
    let body = json!({ "ready": ready, "uptime_seconds": uptime });

    if ready {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}
