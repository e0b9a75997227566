// MCP Gateway - auth
// Optional Bearer secret check plus the caller-identity seam.
// If AUTH_SECRET is set, protected routes require `Authorization: Bearer <secret>`.
// Verified callers are identified by the `X-Caller-Id` header set by the
// fronting auth layer; the proxy refuses requests without an identity.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::state::AppState;

pub const CALLER_HEADER: &str = "x-caller-id";

const MAX_CALLER_LEN: usize = 128;

/// Identity of the verified caller, attached as a request extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

impl CallerIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Enforces the bearer secret when configured and attaches [`CallerIdentity`].
/// Public routes (health, readiness) do not use this middleware.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(secret) = state.config.auth_secret.as_deref() {
        let token = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "));
        match token {
            Some(token) if bool::from(token.as_bytes().ct_eq(secret.as_bytes())) => {}
            Some(_) => {
                tracing::warn!("Auth failed: invalid token");
                return Err(StatusCode::UNAUTHORIZED);
            }
            None => {
                tracing::warn!("Auth failed: missing or malformed Authorization header");
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
    }

    if let Some(caller) = caller_from(request.headers()) {
        request.extensions_mut().insert(caller);
    }
    Ok(next.run(request).await)
}

fn caller_from(headers: &axum::http::HeaderMap) -> Option<CallerIdentity> {
    let raw = headers.get(CALLER_HEADER)?.to_str().ok()?.trim();
    if raw.is_empty() || raw.len() > MAX_CALLER_LEN {
        return None;
    }
    Some(CallerIdentity(raw.to_string()))
}
