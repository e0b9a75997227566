pub mod adapter;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod jsonrpc;
pub mod models;
pub mod pool;
pub mod registry;
pub mod router;
pub mod session;
pub mod state;

use axum::middleware;
use axum::routing::{any, get, post};
use axum::Router;

use state::AppState;

/// Build the application router with the given state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        // Service management
        .route("/api/services", get(handlers::list_services))
        .route("/api/services/{id}/health", get(handlers::service_health))
        .route("/api/services/{id}/health/check", post(handlers::check_health))
        .route("/api/services/{id}/enabled", post(handlers::set_enabled))
        .route("/api/services/{id}/restart", post(handlers::restart_service))
        // Gateway entry point
        .route("/proxy/{service}/{*action}", any(handlers::proxy))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        // Health
        .route("/api/health", get(handlers::health))
        .route("/api/health/ready", get(handlers::readiness))
        .merge(protected)
        // Shared state
        .with_state(state)
}
