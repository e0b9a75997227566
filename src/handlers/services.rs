// ---------------------------------------------------------------------------
// handlers/services.rs - Service management: list, health, enable, restart
// ---------------------------------------------------------------------------

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::models::{ServiceHealth, ServiceSummary, TransportConfig};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

/// GET /api/services
pub async fn list_services(State(state): State<AppState>) -> Json<Vec<ServiceSummary>> {
    let services = state
        .registry
        .list()
        .iter()
        .map(|r| ServiceSummary::new(r, state.pool.live(r.id).is_some()))
        .collect();
    Json(services)
}

/// GET /api/services/{id}/health - last known report, no probe.
pub async fn service_health(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ServiceHealth>, GatewayError> {
    state.health.get_health(id).map(Json)
}

/// POST /api/services/{id}/health/check - probe now. Concurrent checks of
/// the same service share one probe.
pub async fn check_health(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ServiceHealth>, GatewayError> {
    state.health.trigger(id).await.map(Json)
}

/// POST /api/services/{id}/enabled
pub async fn set_enabled(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<EnabledRequest>,
) -> Result<Json<ServiceSummary>, GatewayError> {
    let record = state.registry.set_enabled(id, req.enabled)?;
    let running = state.pool.live(id).is_some();
    Ok(Json(ServiceSummary::new(&record, running)))
}

/// POST /api/services/{id}/restart
pub async fn restart_service(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, GatewayError> {
    let record = state
        .registry
        .get_by_id(id)
        .ok_or_else(|| GatewayError::ServiceNotFound {
            service: id.to_string(),
        })?;
    if let TransportConfig::Http { .. } = record.transport {
        return Err(GatewayError::BadRequest(format!(
            "service '{}' is plain HTTP and has no adapter to restart",
            record.slug
        )));
    }
    let conn = state.pool.restart(id).await?;
    Ok(Json(json!({
        "success": true,
        "service_id": id,
        "adapter_state": conn.state(),
    })))
}
