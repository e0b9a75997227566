// ---------------------------------------------------------------------------
// handlers/ - axum handlers grouped by surface
// mod.rs re-exports all public items so routes can use `handlers::*`.
// ---------------------------------------------------------------------------

pub(crate) mod proxy;
pub(crate) mod services;
pub(crate) mod system;

pub use proxy::proxy;
pub use services::{check_health, list_services, restart_service, service_health, set_enabled, EnabledRequest};
pub use system::{health, readiness};
