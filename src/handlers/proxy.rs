// ---------------------------------------------------------------------------
// handlers/proxy.rs - Catch-all `/proxy/{service}/{*action}` entry point
// ---------------------------------------------------------------------------

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Extension, Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::auth::CallerIdentity;
use crate::bridge;
use crate::error::GatewayError;
use crate::jsonrpc::Frame;
use crate::router::{self, Dispatch};
use crate::state::AppState;

/// Largest JSON-RPC frame accepted from a client.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

pub async fn proxy(
    State(state): State<AppState>,
    Path((service, action)): Path<(String, String)>,
    caller: Option<Extension<CallerIdentity>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(Extension(caller)) = caller else {
        tracing::warn!(service = %service, "proxy: request without caller identity");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "success": false,
                "error": { "code": "Unauthorized", "message": "caller identity required" }
            })),
        )
            .into_response();
    };

    handle(state, service, action, caller, method, uri, headers, body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

#[allow(clippy::too_many_arguments)]
async fn handle(
    state: AppState,
    service: String,
    action: String,
    caller: CallerIdentity,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, GatewayError> {
    let record = state.router.resolve(&service)?;
    let decision = router::dispatch(&record, &action, &method)?;
    tracing::debug!(service = %record.slug, caller = %caller.as_str(), "proxy: {:?}", decision);

    match decision {
        Dispatch::OpenSession => {
            let conn = state.router.connect(&record).await?;
            let (session, rx) = state.sessions.open(&record, caller.as_str());
            session.attach(conn);
            let endpoint = format!("/proxy/{}/message?sessionId={}", record.slug, session.id());
            let events = state.sessions.event_stream(session, rx, endpoint);
            Ok(Sse::new(events)
                .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("heartbeat"))
                .into_response())
        }
        Dispatch::SessionMessage => {
            let session_id = session_id(&uri)
                .ok_or_else(|| GatewayError::BadRequest("missing sessionId query parameter".into()))?;
            let session = state.sessions.get(&session_id, record.id, caller.as_str())?;
            let frame = read_frame(body).await?;
            state.router.dispatch_to_session(record, session, frame);
            Ok(StatusCode::ACCEPTED.into_response())
        }
        Dispatch::Call => {
            let frame = read_frame(body).await?;
            if !frame.is_request() {
                state.router.notify(&record, &frame).await?;
                return Ok(StatusCode::ACCEPTED.into_response());
            }
            if wants_event_stream(&headers) {
                let id = frame.id().cloned().unwrap_or(Value::Null);
                let frames = state.router.stream(&record, frame).await?;
                Ok(Sse::new(bridge::frames_to_events(frames, id))
                    .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE).text("heartbeat"))
                    .into_response())
            } else {
                let response = state.router.call(&record, frame).await?;
                Ok(Json(response).into_response())
            }
        }
        Dispatch::Passthrough { path } => state
            .router
            .forward(&record, &path, method, &headers, uri.query(), body)
            .await
            .map(IntoResponse::into_response),
    }
}

async fn read_frame(body: Body) -> Result<Frame, GatewayError> {
    let bytes = axum::body::to_bytes(body, MAX_FRAME_BYTES)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("unreadable body: {e}")))?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|_| GatewayError::BadRequest("body is not valid UTF-8".into()))?;
    Frame::parse_line(text.trim()).map_err(GatewayError::BadRequest)
}

fn session_id(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "sessionId")
        .map(|(_, v)| v.into_owned())
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}
