// MCP Gateway - adapter core
//! One live upstream connection speaking line-delimited JSON-RPC.
//!
//! A [`Connection`] owns the write half (serialized behind an async mutex) and a
//! dedicated reader task over the read half. Outbound requests get a fresh
//! numeric correlation id; the reader routes each inbound response back to
//! the slot holding that id and restores the caller's original id.
//! `notifications/progress` frames are routed by progress token the same way.
//! Everything else is broadcast to subscribers.
//!
//! The transport behind a connection is either a child process
//! ([`process`]) or an upstream SSE session (`crate::bridge::sse`); both feed
//! the same line stream abstraction.

pub mod launcher;
pub mod process;
pub mod restart;

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::jsonrpc::{self, Frame};
use crate::models::AdapterState;

/// Consecutive unparseable lines after which the adapter is marked `Degraded`.
pub const MALFORMED_THRESHOLD: u32 = 3;

pub type LineStream = BoxStream<'static, io::Result<String>>;

/// Serialized write side of a connection. One call writes exactly one frame.
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_line(&mut self, line: &str) -> io::Result<()>;
}

/// Newline-terminated frames over any async byte sink (child stdin, duplex pipe).
pub struct PipeWriter<W> {
    inner: W,
}

impl<W> PipeWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> FrameWriter for PipeWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Buffered frames per correlation slot. A consumer that lets its slot
    /// fill up loses the call with `FlowControlOverflow`.
    pub slot_capacity: usize,
    pub notification_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            slot_capacity: 256,
            notification_capacity: 1024,
        }
    }
}

struct Slot {
    tx: mpsc::Sender<Frame>,
    original_id: Value,
    original_token: Option<Value>,
    cause: Arc<OnceLock<GatewayError>>,
}

#[derive(Default)]
struct Pending {
    closed: Option<GatewayError>,
    slots: HashMap<u64, Slot>,
}

pub struct Connection {
    service_id: i64,
    service: String,
    writer: tokio::sync::Mutex<Box<dyn FrameWriter>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    notifications: broadcast::Sender<Frame>,
    state: watch::Sender<AdapterState>,
    shutdown: CancellationToken,
    init_result: OnceLock<Value>,
    opts: ConnectionOptions,
}

impl Connection {
    /// Wraps an established transport and starts the reader task.
    pub fn start(
        service_id: i64,
        service: impl Into<String>,
        writer: Box<dyn FrameWriter>,
        lines: LineStream,
        opts: ConnectionOptions,
    ) -> Arc<Connection> {
        let (notifications, _) = broadcast::channel(opts.notification_capacity.max(1));
        let (state, _) = watch::channel(AdapterState::Starting);
        let conn = Arc::new(Connection {
            service_id,
            service: service.into(),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
            notifications,
            state,
            shutdown: CancellationToken::new(),
            init_result: OnceLock::new(),
            opts,
        });
        tokio::spawn(conn.clone().read_loop(lines));
        conn
    }

    /// Convenience for byte pipes: frames are newline separated.
    pub fn from_io<R, W>(
        service_id: i64,
        service: impl Into<String>,
        reader: R,
        writer: W,
        opts: ConnectionOptions,
    ) -> Arc<Connection>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let lines = LinesStream::new(BufReader::new(reader).lines()).boxed();
        Self::start(service_id, service, Box::new(PipeWriter::new(writer)), lines, opts)
    }

    pub fn service_id(&self) -> i64 {
        self.service_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> AdapterState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Cancelled once the connection is closed or crashed. Transports use it
    /// to tear down the underlying process or socket.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resolves with the terminal state once the connection is gone.
    pub async fn wait_terminal(&self) -> AdapterState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => AdapterState::Stopped,
        }
    }

    pub fn closed_reason(&self) -> Option<GatewayError> {
        self.lock_pending().closed.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().slots.len()
    }

    /// Frames not correlated with any call: server notifications, log
    /// messages, server-to-client requests.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.notifications.subscribe()
    }

    /// Moves a live adapter to `Degraded` (repeated probe failures).
    pub fn mark_degraded(&self) {
        self.state.send_if_modified(|s| {
            if *s == AdapterState::Running {
                *s = AdapterState::Degraded;
                true
            } else {
                false
            }
        });
    }

    pub fn mark_running(&self) {
        self.state.send_if_modified(|s| {
            if matches!(*s, AdapterState::Starting | AdapterState::Degraded) {
                *s = AdapterState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Performs the MCP `initialize` handshake once for this connection and
    /// caches the server's result for later client `initialize` requests.
    pub async fn handshake(self: &Arc<Self>, timeout: Duration) -> Result<Value, GatewayError> {
        let request = Frame::request(
            json!(0),
            jsonrpc::METHOD_INITIALIZE,
            Some(json!({
                "protocolVersion": jsonrpc::PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        );

        let response = tokio::time::timeout(timeout, self.exchange(request, false))
            .await
            .map_err(|_| GatewayError::SpawnError {
                service: self.service.clone(),
                reason: format!("initialize timed out after {}ms", timeout.as_millis()),
            })??;

        if let Some(err) = response.error_value() {
            return Err(GatewayError::SpawnError {
                service: self.service.clone(),
                reason: format!("initialize rejected: {err}"),
            });
        }

        let result = response.result_value().cloned().unwrap_or(Value::Null);
        let _ = self.init_result.set(result.clone());
        self.write(&Frame::notification(jsonrpc::METHOD_INITIALIZED, None))
            .await?;
        self.mark_running();

        tracing::info!(
            service = %self.service,
            service_id = self.service_id,
            "adapter: initialized (server: {})",
            result
                .get("serverInfo")
                .and_then(|s| s.get("name"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown")
        );
        Ok(result)
    }

    /// Sends a request and waits for its single response.
    pub async fn call(self: &Arc<Self>, request: Frame) -> Result<Frame, GatewayError> {
        if let Some(cached) = self.cached_initialize(&request) {
            return Ok(cached);
        }
        self.exchange(request, false).await
    }

    async fn exchange(
        self: &Arc<Self>,
        request: Frame,
        inject_progress: bool,
    ) -> Result<Frame, GatewayError> {
        let mut frames = self.open(request, inject_progress).await?;
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            if frame.is_response() {
                return Ok(frame);
            }
        }
        Err(self.crashed("response stream ended without a result"))
    }

    /// Sends a request and returns every frame correlated with it: progress
    /// notifications followed by the terminal response. Dropping the stream
    /// releases the correlation slot.
    pub async fn stream(self: &Arc<Self>, request: Frame) -> Result<FrameStream, GatewayError> {
        if let Some(cached) = self.cached_initialize(&request) {
            return Ok(FrameStream::ready(self.clone(), cached));
        }
        self.open(request, true).await
    }

    /// Writes a frame that expects no response (notifications, replies to
    /// server-initiated requests). Client `notifications/initialized` is
    /// absorbed since the gateway already completed the handshake.
    pub async fn notify(&self, frame: &Frame) -> Result<(), GatewayError> {
        if frame.method() == Some(jsonrpc::METHOD_INITIALIZED) && self.init_result.get().is_some() {
            return Ok(());
        }
        if let Some(err) = self.closed_reason() {
            return Err(err);
        }
        self.write(frame).await
    }

    /// Closes the connection: every pending call fails with `reason` and the
    /// transport is torn down. Idempotent; the first reason wins.
    pub fn close(&self, reason: GatewayError) {
        if self.terminate(reason, AdapterState::Stopped) {
            tracing::info!(service = %self.service, service_id = self.service_id, "adapter: closed");
        }
    }

    /// Marks the transport as dead (process exit, socket loss).
    pub fn crash(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let err = GatewayError::UpstreamCrashed {
            service: self.service.clone(),
            reason: reason.clone(),
        };
        if self.terminate(err, AdapterState::Crashed) {
            tracing::warn!(
                service = %self.service,
                service_id = self.service_id,
                "adapter: upstream crashed: {}",
                reason
            );
        }
    }

    fn terminate(&self, reason: GatewayError, state: AdapterState) -> bool {
        let slots = {
            let mut pending = self.lock_pending();
            if pending.closed.is_some() {
                return false;
            }
            pending.closed = Some(reason.clone());
            std::mem::take(&mut pending.slots)
        };
        for (_, slot) in slots {
            let _ = slot.cause.set(reason.clone());
        }
        self.state.send_replace(state);
        self.shutdown.cancel();
        true
    }

    fn cached_initialize(&self, request: &Frame) -> Option<Frame> {
        if request.method() != Some(jsonrpc::METHOD_INITIALIZE) {
            return None;
        }
        let result = self.init_result.get()?;
        let id = request.id().cloned().unwrap_or(Value::Null);
        Some(Frame::result(id, result.clone()))
    }

    async fn open(
        self: &Arc<Self>,
        request: Frame,
        inject_progress: bool,
    ) -> Result<FrameStream, GatewayError> {
        let Some(original_id) = request.id().cloned() else {
            return Err(GatewayError::BadRequest("request frame has no id".into()));
        };
        if request.method().is_none() {
            return Err(GatewayError::BadRequest("request frame has no method".into()));
        }

        let mut outbound = request;
        let (correlation, rx, cause) = {
            let mut pending = self.lock_pending();
            if let Some(err) = &pending.closed {
                return Err(err.clone());
            }
            let correlation = self.next_id.fetch_add(1, Ordering::Relaxed);
            outbound.set_id(json!(correlation));
            let original_token = if inject_progress || outbound.request_progress_token().is_some() {
                outbound.set_request_progress_token(json!(correlation))
            } else {
                None
            };
            let (tx, rx) = mpsc::channel(self.opts.slot_capacity.max(1));
            let cause = Arc::new(OnceLock::new());
            pending.slots.insert(
                correlation,
                Slot {
                    tx,
                    original_id,
                    original_token,
                    cause: cause.clone(),
                },
            );
            (correlation, rx, cause)
        };

        // Built before the write so a cancelled caller still releases the slot.
        let stream = FrameStream {
            conn: self.clone(),
            correlation: Some(correlation),
            rx: Some(rx),
            cause,
            ready: None,
            finished: false,
        };

        tracing::trace!(
            service = %self.service,
            correlation_id = correlation,
            method = outbound.method().unwrap_or_default(),
            "adapter: -> request"
        );
        self.write(&outbound).await?;
        Ok(stream)
    }

    async fn write(&self, frame: &Frame) -> Result<(), GatewayError> {
        let line = frame.encode();
        let mut writer = self.writer.lock().await;
        match writer.write_line(&line).await {
            Ok(()) => Ok(()),
            // The transport refused this one frame but is still usable.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                Err(GatewayError::BadRequest(e.to_string()))
            }
            Err(e) => {
                drop(writer);
                self.crash(format!("write failed: {e}"));
                Err(self.crashed(format!("write failed: {e}")))
            }
        }
    }

    fn crashed(&self, reason: impl Into<String>) -> GatewayError {
        self.closed_reason().unwrap_or_else(|| GatewayError::UpstreamCrashed {
            service: self.service.clone(),
            reason: reason.into(),
        })
    }

    /// Removes a slot. Returns true if it was still pending.
    fn release(&self, correlation: u64) -> bool {
        self.lock_pending().slots.remove(&correlation).is_some()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn read_loop(self: Arc<Self>, mut lines: LineStream) {
        let mut malformed = 0u32;
        let reason = loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break None,
                next = lines.next() => next,
            };
            let line = match next {
                None => break Some("upstream closed its output".to_string()),
                Some(Err(e)) => break Some(format!("read failed: {e}")),
                Some(Ok(line)) => line,
            };
            if line.trim().is_empty() {
                continue;
            }
            match Frame::parse_line(&line) {
                Ok(frame) => {
                    if malformed >= MALFORMED_THRESHOLD {
                        self.mark_running();
                    }
                    malformed = 0;
                    self.route(frame);
                }
                Err(reason) => {
                    malformed += 1;
                    tracing::warn!(
                        service = %self.service,
                        service_id = self.service_id,
                        "adapter: discarding malformed frame ({}): {}",
                        reason,
                        truncate_line(&line, 200)
                    );
                    if malformed == MALFORMED_THRESHOLD {
                        tracing::warn!(
                            service = %self.service,
                            "adapter: {} consecutive malformed frames, marking degraded",
                            MALFORMED_THRESHOLD
                        );
                        self.mark_degraded();
                    }
                }
            }
        };

        if let Some(reason) = reason {
            self.crash(reason);
        }
    }

    fn route(self: &Arc<Self>, mut frame: Frame) {
        if frame.is_response() {
            let Some(correlation) = frame.id().and_then(jsonrpc::correlation_of) else {
                tracing::debug!(service = %self.service, "adapter: response with foreign id, broadcasting");
                let _ = self.notifications.send(frame);
                return;
            };
            let slot = self.lock_pending().slots.remove(&correlation);
            match slot {
                Some(slot) => {
                    frame.set_id(slot.original_id.clone());
                    self.deliver(correlation, &slot.tx, &slot.cause, frame);
                }
                None => {
                    tracing::debug!(
                        service = %self.service,
                        correlation_id = correlation,
                        "adapter: late response for released slot dropped"
                    );
                }
            }
            return;
        }

        if let Some(correlation) = frame.progress_token().and_then(jsonrpc::correlation_of) {
            let target = {
                let pending = self.lock_pending();
                pending
                    .slots
                    .get(&correlation)
                    .map(|s| (s.tx.clone(), s.cause.clone(), s.original_token.clone()))
            };
            if let Some((tx, cause, original_token)) = target {
                if let Some(token) = original_token {
                    frame.set_progress_token(token);
                }
                self.deliver(correlation, &tx, &cause, frame);
                return;
            }
        }

        let _ = self.notifications.send(frame);
    }

    /// Hands a frame to a slot without waiting. The reader serves every call
    /// on the connection, so a consumer whose slot is full loses the call with
    /// `FlowControlOverflow` and the upstream is told to stop.
    fn deliver(
        self: &Arc<Self>,
        correlation: u64,
        tx: &mpsc::Sender<Frame>,
        cause: &OnceLock<GatewayError>,
        frame: Frame,
    ) {
        match tx.try_send(frame) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    service = %self.service,
                    correlation_id = correlation,
                    "adapter: consumer fell behind, dropping slot"
                );
                let _ = cause.set(GatewayError::FlowControlOverflow {
                    service: self.service.clone(),
                });
                if self.release(correlation) {
                    self.cancel_upstream(correlation, "client fell behind");
                }
            }
        }
    }

    /// Sends `notifications/cancelled` for an abandoned correlation id.
    fn cancel_upstream(self: &Arc<Self>, correlation: u64, reason: &'static str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let conn = self.clone();
        handle.spawn(async move {
            let cancel = Frame::notification(
                jsonrpc::METHOD_CANCELLED,
                Some(json!({ "requestId": correlation, "reason": reason })),
            );
            let _ = conn.notify(&cancel).await;
        });
    }
}

/// Frames correlated with one request. Yields the terminal response last;
/// a failure (crash, overflow, disable) is yielded once as an error.
pub struct FrameStream {
    conn: Arc<Connection>,
    correlation: Option<u64>,
    rx: Option<mpsc::Receiver<Frame>>,
    cause: Arc<OnceLock<GatewayError>>,
    ready: Option<Frame>,
    finished: bool,
}

impl FrameStream {
    fn ready(conn: Arc<Connection>, frame: Frame) -> Self {
        Self {
            conn,
            correlation: None,
            rx: None,
            cause: Arc::new(OnceLock::new()),
            ready: Some(frame),
            finished: false,
        }
    }

    pub fn correlation_id(&self) -> Option<u64> {
        self.correlation
    }
}

impl Stream for FrameStream {
    type Item = Result<Frame, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(frame) = this.ready.take() {
            this.finished = true;
            return Poll::Ready(Some(Ok(frame)));
        }
        let Some(rx) = this.rx.as_mut() else {
            this.finished = true;
            return Poll::Ready(None);
        };
        match rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(frame)) => {
                if frame.is_response() {
                    this.finished = true;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                let err = this
                    .cause
                    .get()
                    .cloned()
                    .or_else(|| this.conn.closed_reason())
                    .unwrap_or_else(|| GatewayError::UpstreamCrashed {
                        service: this.conn.service.clone(),
                        reason: "correlation slot dropped".into(),
                    });
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        let Some(correlation) = self.correlation else {
            return;
        };
        if !self.conn.release(correlation) || self.conn.closed_reason().is_some() {
            return;
        }
        // Abandoned mid-flight: tell the upstream it can stop working on it.
        self.conn.cancel_upstream(correlation, "client went away");
    }
}

pub(crate) fn truncate_line(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let boundary = s
            .char_indices()
            .take_while(|(i, _)| *i < max_len)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(max_len);
        format!("{}...", &s[..boundary])
    }
}
