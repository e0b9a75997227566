// MCP Gateway - stream sessions
//! Client-facing SSE sessions.
//!
//! Each session owns a bounded queue of frames waiting to be written to the
//! client. Producers (call tasks, the notification forwarder) wait at most the
//! flow-control grace when the queue is full; after that the session is closed
//! with `FlowControlOverflow`. Dropping the client connection cancels the
//! session, which stops its call tasks and releases their correlation slots
//! without touching the adapter.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::response::sse::Event;
use futures_util::stream::Stream;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::Connection;
use crate::bridge;
use crate::error::GatewayError;
use crate::jsonrpc::Frame;
use crate::models::ServiceRecord;
use crate::registry::RegistryListener;

pub struct StreamSession {
    id: Uuid,
    service_id: i64,
    service: String,
    caller: String,
    tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    reason: OnceLock<GatewayError>,
    in_flight: AtomicUsize,
    idle: Notify,
    grace: Duration,
}

impl StreamSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn service_id(&self) -> i64 {
        self.service_id
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    /// Cancelled when the client disconnects or the session is closed.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<GatewayError> {
        self.reason.get().cloned()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Terminates the session; the client receives one final error event.
    pub fn close(&self, reason: GatewayError) {
        if self.reason.set(reason).is_ok() {
            tracing::debug!(session = %self.id, service = %self.service, "session: closed");
        }
        self.cancel.cancel();
    }

    /// Queues a frame for the client, honoring the flow-control grace.
    pub async fn push(&self, frame: Frame) -> Result<(), GatewayError> {
        let frame = match self.tx.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(self.gone()),
            Err(TrySendError::Full(frame)) => frame,
        };
        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.gone()),
            sent = self.tx.send_timeout(frame, self.grace) => sent,
        };
        match sent {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(self.gone()),
            Err(SendTimeoutError::Timeout(_)) => {
                tracing::warn!(
                    session = %self.id,
                    service = %self.service,
                    "session: client queue full for {:?}, dropping connection",
                    self.grace
                );
                let err = GatewayError::FlowControlOverflow {
                    service: self.service.clone(),
                };
                self.close(err.clone());
                Err(err)
            }
        }
    }

    fn gone(&self) -> GatewayError {
        self.close_reason()
            .unwrap_or_else(|| GatewayError::SessionNotFound(self.id.to_string()))
    }

    /// Resolves once no call is in flight.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Marks one call as in flight for the lifetime of the returned guard.
    pub fn track_call(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            session: self.clone(),
        }
    }

    /// Forwards uncorrelated upstream frames to this session and closes it
    /// when the adapter goes away. Calls still in flight get up to the
    /// flow-control grace to queue what the upstream already answered.
    pub fn attach(self: &Arc<Self>, conn: Arc<Connection>) {
        let session = self.clone();
        let mut notifications = conn.subscribe();
        tokio::spawn(async move {
            let cancel = session.cancelled();
            loop {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = conn.wait_terminal() => {
                        let _ = tokio::time::timeout(session.grace, session.wait_idle()).await;
                        let reason = conn.closed_reason().unwrap_or_else(|| GatewayError::UpstreamCrashed {
                            service: session.service.clone(),
                            reason: "adapter terminated".into(),
                        });
                        session.close(reason);
                        return;
                    }
                    received = notifications.recv() => received,
                };
                match received {
                    Ok(frame) => {
                        if session.push(frame).await.is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            session = %session.id,
                            "session: missed {} upstream notifications",
                            skipped
                        );
                        session.close(GatewayError::FlowControlOverflow {
                            service: session.service.clone(),
                        });
                        return;
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }
}

pub struct InFlight {
    session: Arc<StreamSession>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.session.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.session.idle.notify_waiters();
        }
    }
}

/// All open sessions, keyed by session id.
pub struct SessionHub {
    sessions: Mutex<HashMap<Uuid, Arc<StreamSession>>>,
    capacity: usize,
    grace: Duration,
}

impl SessionHub {
    pub fn new(capacity: usize, grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            grace,
        })
    }

    pub fn open(
        self: &Arc<Self>,
        record: &ServiceRecord,
        caller: &str,
    ) -> (Arc<StreamSession>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let session = Arc::new(StreamSession {
            id: Uuid::new_v4(),
            service_id: record.id,
            service: record.slug.clone(),
            caller: caller.to_string(),
            tx,
            cancel: CancellationToken::new(),
            reason: OnceLock::new(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            grace: self.grace,
        });
        self.lock().insert(session.id, session.clone());
        tracing::info!(
            session = %session.id,
            service = %record.slug,
            caller = %caller,
            "session: opened"
        );
        (session, rx)
    }

    /// Looks up a session for a follow-up POST. Sessions are only visible to
    /// the caller that opened them, on the service they were opened for.
    pub fn get(
        &self,
        session_id: &str,
        service_id: i64,
        caller: &str,
    ) -> Result<Arc<StreamSession>, GatewayError> {
        let not_found = || GatewayError::SessionNotFound(session_id.to_string());
        let id = Uuid::parse_str(session_id).map_err(|_| not_found())?;
        let session = self.lock().get(&id).cloned().ok_or_else(not_found)?;
        if session.service_id != service_id || session.caller != caller || session.is_closed() {
            return Err(not_found());
        }
        Ok(session)
    }

    pub fn remove(&self, id: Uuid) {
        if let Some(session) = self.lock().remove(&id) {
            session.cancel.cancel();
            tracing::info!(session = %id, service = %session.service, "session: client disconnected");
        }
    }

    /// Closes every session of a service with `reason`.
    pub fn close_service(&self, service_id: i64, reason: GatewayError) -> usize {
        let closing: Vec<Arc<StreamSession>> = {
            let mut sessions = self.lock();
            let ids: Vec<Uuid> = sessions
                .values()
                .filter(|s| s.service_id == service_id)
                .map(|s| s.id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &closing {
            session.close(reason.clone());
        }
        closing.len()
    }

    pub fn count_for(&self, service_id: i64) -> usize {
        self.lock()
            .values()
            .filter(|s| s.service_id == service_id)
            .count()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn close_all(&self, reason: GatewayError) {
        let all: Vec<Arc<StreamSession>> = self.lock().drain().map(|(_, s)| s).collect();
        for session in all {
            session.close(reason.clone());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<StreamSession>>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Client-facing SSE stream: the endpoint event, then queued frames in
    /// order, then a terminal error event if the session was closed by the
    /// gateway. Frames queued before the close are still delivered, except
    /// after a flow-control overflow. Dropping the stream unregisters the
    /// session.
    pub fn event_stream(
        self: &Arc<Self>,
        session: Arc<StreamSession>,
        mut rx: mpsc::Receiver<Frame>,
        endpoint: String,
    ) -> impl Stream<Item = Result<Event, Infallible>> + Send + use<> {
        let guard = SessionGuard {
            hub: self.clone(),
            id: session.id,
        };
        async_stream::stream! {
            let _guard = guard;
            let cancel = session.cancelled();
            yield Ok(bridge::endpoint_event(&endpoint));
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    frame = rx.recv() => frame,
                };
                match next {
                    Some(frame) => yield Ok(bridge::message_event(&frame)),
                    None => break,
                }
            }
            let reason = session.close_reason();
            let overflowed = matches!(reason, Some(GatewayError::FlowControlOverflow { .. }));
            if !overflowed {
                while let Ok(frame) = rx.try_recv() {
                    yield Ok(bridge::message_event(&frame));
                }
            }
            if let Some(reason) = reason {
                yield Ok(bridge::error_event(Value::Null, &reason));
            }
        }
    }
}

struct SessionGuard {
    hub: Arc<SessionHub>,
    id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hub.remove(self.id);
    }
}

impl RegistryListener for SessionHub {
    fn service_disabled(&self, record: &ServiceRecord) {
        let closed = self.close_service(
            record.id,
            GatewayError::ServiceDisabled {
                service: record.slug.clone(),
            },
        );
        if closed > 0 {
            tracing::info!(service = %record.slug, "session: closed {} session(s) on disable", closed);
        }
    }

    fn service_removed(&self, record: &ServiceRecord) {
        self.service_disabled(record);
    }

    fn service_reconfigured(&self, record: &ServiceRecord) {
        self.close_service(
            record.id,
            GatewayError::ServiceUnavailable {
                service: record.slug.clone(),
                reason: "service reconfigured".into(),
            },
        );
    }
}
