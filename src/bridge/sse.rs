// MCP Gateway - upstream SSE transport
//! SSE decoding and the client side of the MCP SSE transport.
//!
//! An `sse` service is driven through one persistent `GET` on its URL. The
//! first `endpoint` event names where frames are POSTed; every subsequent
//! `message` event carries one JSON-RPC frame. The resulting frame stream
//! feeds a regular [`Connection`], so correlation, progress routing and crash
//! handling are shared with stdio services.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use url::Url;

use crate::adapter::{Connection, ConnectionOptions, FrameWriter};
use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Data of a JSON-RPC carrying event (`message` or unnamed).
    pub fn message_data(self) -> Option<String> {
        match self.event.as_deref() {
            None | Some("message") if !self.data.is_empty() => Some(self.data),
            _ => None,
        }
    }
}

/// Incremental decoder. Bytes may arrive split anywhere, including inside a
/// UTF-8 sequence; only complete events are emitted.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block[..pos])) {
                events.push(event);
            }
        }
        events
    }

    /// Emits a trailing event that was not blank-line terminated.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let block = std::mem::take(&mut self.buffer);
        parse_block(&String::from_utf8_lossy(&block))
            .into_iter()
            .collect()
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut id = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }
    if data.is_empty() && event.is_none() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
        id,
    })
}

/// Writes frames by POSTing them to the session endpoint announced upstream.
struct HttpPostWriter {
    client: reqwest::Client,
    endpoint: Url,
}

#[async_trait]
impl FrameWriter for HttpPostWriter {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(line.to_string())
            .send()
            .await
            .map_err(io::Error::other)?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("upstream rejected frame: {status}"),
            ))
        } else {
            Err(io::Error::other(format!("upstream answered {status}")))
        }
    }
}

/// Opens the upstream SSE session and waits for its `endpoint` event.
pub async fn connect(
    service_id: i64,
    service: &str,
    url: &str,
    client: &reqwest::Client,
    opts: ConnectionOptions,
    timeout: Duration,
) -> Result<Arc<Connection>, GatewayError> {
    let fail = |reason: String| GatewayError::SpawnError {
        service: service.to_string(),
        reason,
    };

    let base = Url::parse(url).map_err(|e| fail(format!("invalid upstream url: {e}")))?;
    let deadline = tokio::time::Instant::now() + timeout;

    let resp = tokio::time::timeout_at(
        deadline,
        client
            .get(base.clone())
            .header(ACCEPT, "text/event-stream")
            .send(),
    )
    .await
    .map_err(|_| fail("timed out connecting to upstream".into()))?
    .map_err(|e| fail(format!("upstream connect failed: {e}")))?;
    if !resp.status().is_success() {
        return Err(fail(format!("upstream answered {}", resp.status())));
    }

    let mut bytes = resp.bytes_stream().boxed();
    let mut decoder = SseDecoder::new();
    let mut backlog = Vec::new();
    let endpoint = loop {
        let chunk = match tokio::time::timeout_at(deadline, bytes.next()).await {
            Err(_) => return Err(fail("no endpoint event from upstream".into())),
            Ok(None) => return Err(fail("upstream closed before endpoint event".into())),
            Ok(Some(Err(e))) => return Err(fail(format!("upstream read failed: {e}"))),
            Ok(Some(Ok(chunk))) => chunk,
        };
        let mut found = None;
        for event in decoder.feed(&chunk) {
            if found.is_none() && event.event.as_deref() == Some("endpoint") {
                found = Some(event.data);
            } else if found.is_some() {
                backlog.push(event);
            }
        }
        if let Some(endpoint) = found {
            break endpoint;
        }
    };
    let endpoint = base
        .join(endpoint.trim())
        .map_err(|e| fail(format!("invalid endpoint '{endpoint}': {e}")))?;

    tracing::info!(service = %service, service_id, "sse: upstream session at {}", endpoint);

    let lines = async_stream::stream! {
        for event in backlog {
            if let Some(data) = event.message_data() {
                yield Ok(data);
            }
        }
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in decoder.feed(&chunk) {
                        if let Some(data) = event.message_data() {
                            yield Ok(data);
                        }
                    }
                }
                Err(e) => {
                    yield Err(io::Error::other(e));
                    break;
                }
            }
        }
        for event in decoder.flush() {
            if let Some(data) = event.message_data() {
                yield Ok(data);
            }
        }
    };

    let writer = HttpPostWriter {
        client: client.clone(),
        endpoint,
    };
    Ok(Connection::start(
        service_id,
        service,
        Box::new(writer),
        lines.boxed(),
        opts,
    ))
}
