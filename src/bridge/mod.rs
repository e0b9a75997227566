// MCP Gateway - protocol bridge
//! Normalizes the three service transports for the router.
//!
//! * `stdio` and `sse` services both end up as an [`adapter::Connection`]
//!   (child pipes, or the upstream SSE session in [`sse`]).
//! * `http` services are forwarded verbatim by [`http`].
//!
//! Frames headed to a client speaking SSE are re-encoded here: one
//! `event: message` per frame, data identical to the upstream line.
//!
//! [`adapter::Connection`]: crate::adapter::Connection

pub mod http;
pub mod sse;

use std::convert::Infallible;

use axum::response::sse::Event;
use futures_util::stream::{Stream, StreamExt};
use serde_json::Value;

use crate::error::GatewayError;
use crate::jsonrpc::Frame;

pub const EVENT_ENDPOINT: &str = "endpoint";
pub const EVENT_MESSAGE: &str = "message";

pub fn message_event(frame: &Frame) -> Event {
    Event::default().event(EVENT_MESSAGE).data(frame.encode())
}

pub fn endpoint_event(path: &str) -> Event {
    Event::default().event(EVENT_ENDPOINT).data(path)
}

/// Terminal event for a failed call or a torn-down session.
pub fn error_event(id: Value, err: &GatewayError) -> Event {
    message_event(&Frame::error(id, err))
}

/// stdio/sse frames to client SSE events, order preserved. A failure becomes
/// one JSON-RPC error event for `request_id` and ends the stream.
pub fn frames_to_events<S>(
    frames: S,
    request_id: Value,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static
where
    S: Stream<Item = Result<Frame, GatewayError>> + Send + 'static,
{
    frames.map(move |item| {
        Ok(match item {
            Ok(frame) => message_event(&frame),
            Err(err) => error_event(request_id.clone(), &err),
        })
    })
}
