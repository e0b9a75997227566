// MCP Gateway - gateway router
//! Resolves `/proxy/{service}/{action}` requests to an upstream.
//!
//! The routing decision is a pure function of the service record, the action
//! path and the HTTP method ([`admit`] + [`dispatch`]); the service's declared
//! transport alone decides between bridging and passthrough. [`GatewayRouter`]
//! then executes the decision with a per-call deadline and, for idempotent
//! methods only, one retry after an upstream crash.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Response};
use futures_util::stream::{BoxStream, StreamExt};
use serde_json::Value;
use tokio::time::Instant;

use crate::adapter::Connection;
use crate::bridge::http::{self as passthrough, ForwardRequest};
use crate::error::GatewayError;
use crate::jsonrpc::{self, Frame};
use crate::models::{ServiceRecord, TransportConfig};
use crate::pool::AdapterPool;
use crate::registry::ServiceRegistry;
use crate::session::StreamSession;

pub const ACTION_SSE: &str = "sse";
pub const ACTION_MESSAGE: &str = "message";
pub const ACTION_MCP: &str = "mcp";

/// What a proxied request turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// `GET sse`: open a client SSE session bridged to the adapter.
    OpenSession,
    /// `POST message?sessionId=`: JSON-RPC frame for an open session.
    SessionMessage,
    /// `POST mcp`: one JSON-RPC exchange, JSON or SSE answer.
    Call,
    /// Plain HTTP service: forward `path` verbatim.
    Passthrough { path: String },
}

/// Refuses disabled and unhealthy services.
pub fn admit(record: &ServiceRecord) -> Result<(), GatewayError> {
    if !record.enabled {
        return Err(GatewayError::ServiceDisabled {
            service: record.slug.clone(),
        });
    }
    if record.health.refuses_traffic() {
        return Err(GatewayError::ServiceUnavailable {
            service: record.slug.clone(),
            reason: format!("service is {}", record.health),
        });
    }
    Ok(())
}

pub fn dispatch(record: &ServiceRecord, action: &str, method: &Method) -> Result<Dispatch, GatewayError> {
    let action = action.trim_matches('/');
    if let TransportConfig::Http { .. } = record.transport {
        return Ok(Dispatch::Passthrough {
            path: action.to_string(),
        });
    }
    match (action, method) {
        (ACTION_SSE, &Method::GET) => Ok(Dispatch::OpenSession),
        (ACTION_MESSAGE, &Method::POST) => Ok(Dispatch::SessionMessage),
        (ACTION_MCP, &Method::POST) => Ok(Dispatch::Call),
        _ => Err(GatewayError::BadRequest(format!(
            "unsupported action {} /{} for service '{}'",
            method, action, record.slug
        ))),
    }
}

pub type FrameResults = BoxStream<'static, Result<Frame, GatewayError>>;

pub struct GatewayRouter {
    registry: Arc<ServiceRegistry>,
    pool: Arc<AdapterPool>,
    client: reqwest::Client,
    call_timeout: Duration,
}

impl GatewayRouter {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        pool: Arc<AdapterPool>,
        client: reqwest::Client,
        call_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pool,
            client,
            call_timeout,
        })
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Registry lookup plus admission.
    pub fn resolve(&self, slug: &str) -> Result<Arc<ServiceRecord>, GatewayError> {
        let record = self.registry.get(slug)?;
        admit(&record)?;
        Ok(record)
    }

    fn timeout_error(&self, record: &ServiceRecord) -> GatewayError {
        GatewayError::GatewayTimeout {
            service: record.slug.clone(),
            timeout_ms: self.call_timeout.as_millis() as u64,
        }
    }

    async fn connection(&self, record: &ServiceRecord, deadline: Instant) -> Result<Arc<Connection>, GatewayError> {
        tokio::time::timeout_at(deadline, self.pool.get_or_spawn(record))
            .await
            .map_err(|_| self.timeout_error(record))?
    }

    /// One request, one response. Idempotent methods are retried once on a
    /// fresh adapter when the first attempt died with the upstream.
    pub async fn call(&self, record: &ServiceRecord, request: Frame) -> Result<Frame, GatewayError> {
        let deadline = Instant::now() + self.call_timeout;
        let idempotent = request.method().is_some_and(jsonrpc::is_idempotent);

        match self.call_once(record, request.clone(), deadline).await {
            Err(GatewayError::UpstreamCrashed { reason, .. }) if idempotent => {
                tracing::info!(
                    service = %record.slug,
                    method = request.method().unwrap_or_default(),
                    "router: retrying idempotent call after crash ({})",
                    reason
                );
                self.call_once(record, request, deadline).await
            }
            other => other,
        }
    }

    async fn call_once(
        &self,
        record: &ServiceRecord,
        request: Frame,
        deadline: Instant,
    ) -> Result<Frame, GatewayError> {
        let exchange = async {
            let conn = self.pool.get_or_spawn(record).await?;
            conn.call(request).await
        };
        // Dropping the exchange on expiry releases its correlation slot.
        tokio::time::timeout_at(deadline, exchange)
            .await
            .map_err(|_| self.timeout_error(record))?
    }

    /// Every frame correlated with `request`, in upstream order. The deadline
    /// restarts whenever a progress notification arrives; silence for a full
    /// call timeout ends the stream with `GatewayTimeout`.
    pub async fn stream(&self, record: &ServiceRecord, request: Frame) -> Result<FrameResults, GatewayError> {
        let deadline = Instant::now() + self.call_timeout;
        let conn = self.connection(record, deadline).await?;
        let mut frames = tokio::time::timeout_at(deadline, conn.stream(request))
            .await
            .map_err(|_| self.timeout_error(record))??;

        let idle = self.call_timeout;
        let timeout_error = self.timeout_error(record);
        let stream = async_stream::stream! {
            let mut deadline = deadline;
            loop {
                match tokio::time::timeout_at(deadline, frames.next()).await {
                    Ok(Some(Ok(frame))) => {
                        let last = frame.is_response();
                        if frame.progress_token().is_some() {
                            deadline = Instant::now() + idle;
                        }
                        yield Ok(frame);
                        if last {
                            break;
                        }
                    }
                    Ok(Some(Err(err))) => {
                        yield Err(err);
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        yield Err(timeout_error.clone());
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }

    /// Frames that expect no answer: notifications and replies to
    /// server-initiated requests.
    pub async fn notify(&self, record: &ServiceRecord, frame: &Frame) -> Result<(), GatewayError> {
        let deadline = Instant::now() + self.call_timeout;
        let conn = self.connection(record, deadline).await?;
        tokio::time::timeout_at(deadline, conn.notify(frame))
            .await
            .map_err(|_| self.timeout_error(record))?
    }

    /// Live adapter for a session, launching it if needed.
    pub async fn connect(&self, record: &ServiceRecord) -> Result<Arc<Connection>, GatewayError> {
        let deadline = Instant::now() + self.call_timeout;
        self.connection(record, deadline).await
    }

    pub async fn forward(
        &self,
        record: &ServiceRecord,
        path: &str,
        method: Method,
        headers: &HeaderMap,
        query: Option<&str>,
        body: Body,
    ) -> Result<Response<Body>, GatewayError> {
        let TransportConfig::Http { url } = &record.transport else {
            return Err(GatewayError::BadRequest(format!(
                "service '{}' does not accept passthrough requests",
                record.slug
            )));
        };
        passthrough::forward(
            &self.client,
            ForwardRequest {
                service: &record.slug,
                base_url: url,
                action: path,
                query,
                method,
                headers,
                body,
                timeout: self.call_timeout,
            },
        )
        .await
    }

    /// Runs a frame POSTed to a session in the background. Requests stream
    /// their frames (or one error frame) into the session; the work stops as
    /// soon as the session is cancelled.
    pub fn dispatch_to_session(
        self: &Arc<Self>,
        record: Arc<ServiceRecord>,
        session: Arc<StreamSession>,
        frame: Frame,
    ) {
        let router = self.clone();
        tokio::spawn(async move {
            let _in_flight = session.track_call();
            let cancel = session.cancelled();
            let work = async {
                if !frame.is_request() {
                    if let Err(e) = router.notify(&record, &frame).await {
                        tracing::debug!(session = %session.id(), "router: session notify failed: {}", e);
                    }
                    return;
                }
                let id = frame.id().cloned().unwrap_or(Value::Null);
                match router.stream(&record, frame).await {
                    Ok(mut frames) => {
                        while let Some(item) = frames.next().await {
                            let out = item.unwrap_or_else(|e| Frame::error(id.clone(), &e));
                            if session.push(out).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = session.push(Frame::error(id, &e)).await;
                    }
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = work => {}
            }
        });
    }
}
