// MCP Gateway - JSON-RPC framing
//! One JSON-RPC envelope per line, as spoken by stdio MCP servers.
//!
//! A [`Frame`] keeps the exact line it was parsed from so that frames the
//! gateway does not touch are re-emitted byte for byte. Any mutation (id
//! rewrite, progress token injection) drops the raw copy and the frame is
//! re-serialized with its original key order.

use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::GatewayError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_PROGRESS: &str = "notifications/progress";
pub const METHOD_CANCELLED: &str = "notifications/cancelled";
pub const METHOD_PING: &str = "ping";

/// MCP protocol revision announced by the gateway during its own handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Methods that only read server state and may be replayed once after a crash.
const IDEMPOTENT_METHODS: &[&str] = &[
    "ping",
    "initialize",
    "tools/list",
    "resources/list",
    "resources/read",
    "resources/templates/list",
    "prompts/list",
    "prompts/get",
];

pub fn is_idempotent(method: &str) -> bool {
    IDEMPOTENT_METHODS.contains(&method)
}

#[derive(Debug, Clone)]
pub struct Frame {
    body: Map<String, Value>,
    raw: Option<String>,
}

impl Frame {
    /// Parses one line. Blank lines, non-objects and batches are rejected.
    pub fn parse_line(line: &str) -> Result<Frame, String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err("empty line".to_string());
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(body)) => Ok(Frame {
                body,
                raw: Some(trimmed.to_string()),
            }),
            Ok(Value::Array(_)) => Err("batch messages are not supported".to_string()),
            Ok(_) => Err("expected a JSON object".to_string()),
            Err(e) => Err(format!("invalid JSON: {e}")),
        }
    }

    pub fn from_value(value: Value) -> Result<Frame, String> {
        match value {
            Value::Object(body) => Ok(Frame { body, raw: None }),
            Value::Array(_) => Err("batch messages are not supported".to_string()),
            _ => Err("expected a JSON object".to_string()),
        }
    }

    pub fn request(id: Value, method: &str, params: Option<Value>) -> Frame {
        let mut body = Map::new();
        body.insert("jsonrpc".into(), JSONRPC_VERSION.into());
        body.insert("id".into(), id);
        body.insert("method".into(), method.into());
        if let Some(params) = params {
            body.insert("params".into(), params);
        }
        Frame { body, raw: None }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Frame {
        let mut body = Map::new();
        body.insert("jsonrpc".into(), JSONRPC_VERSION.into());
        body.insert("method".into(), method.into());
        if let Some(params) = params {
            body.insert("params".into(), params);
        }
        Frame { body, raw: None }
    }

    pub fn result(id: Value, result: Value) -> Frame {
        let mut body = Map::new();
        body.insert("jsonrpc".into(), JSONRPC_VERSION.into());
        body.insert("id".into(), id);
        body.insert("result".into(), result);
        Frame { body, raw: None }
    }

    /// JSON-RPC error frame carrying the gateway error kind in `data.kind`.
    pub fn error(id: Value, err: &GatewayError) -> Frame {
        let mut body = Map::new();
        body.insert("jsonrpc".into(), JSONRPC_VERSION.into());
        body.insert("id".into(), id);
        body.insert(
            "error".into(),
            json!({
                "code": err.rpc_code(),
                "message": err.sanitized_message(),
                "data": { "kind": err.kind() },
            }),
        );
        Frame { body, raw: None }
    }

    /// Serialized single-line form, without the trailing newline.
    pub fn encode(&self) -> String {
        match &self.raw {
            Some(raw) => raw.clone(),
            // A map of JSON values always serializes.
            None => serde_json::to_string(&self.body).unwrap_or_default(),
        }
    }

    pub fn id(&self) -> Option<&Value> {
        self.body.get("id").filter(|v| !v.is_null())
    }

    pub fn set_id(&mut self, id: Value) {
        self.raw = None;
        self.body.insert("id".into(), id);
    }

    pub fn method(&self) -> Option<&str> {
        self.body.get("method").and_then(Value::as_str)
    }

    pub fn params(&self) -> Option<&Value> {
        self.body.get("params")
    }

    pub fn result_value(&self) -> Option<&Value> {
        self.body.get("result")
    }

    pub fn error_value(&self) -> Option<&Value> {
        self.body.get("error")
    }

    pub fn is_request(&self) -> bool {
        self.method().is_some() && self.id().is_some()
    }

    pub fn is_notification(&self) -> bool {
        self.method().is_some() && self.id().is_none()
    }

    pub fn is_response(&self) -> bool {
        self.method().is_none()
            && self.id().is_some()
            && (self.body.contains_key("result") || self.body.contains_key("error"))
    }

    /// Progress token a request asked for in `params._meta.progressToken`.
    pub fn request_progress_token(&self) -> Option<&Value> {
        self.params()?.get("_meta")?.get("progressToken")
    }

    /// Replaces `params._meta.progressToken`, creating `params` and `_meta` as
    /// needed. Returns the previous token, if any.
    pub fn set_request_progress_token(&mut self, token: Value) -> Option<Value> {
        self.raw = None;
        let params = self
            .body
            .entry("params")
            .or_insert_with(|| Value::Object(Map::new()));
        if !params.is_object() {
            *params = Value::Object(Map::new());
        }
        let meta = params
            .as_object_mut()?
            .entry("_meta")
            .or_insert_with(|| Value::Object(Map::new()));
        if !meta.is_object() {
            *meta = Value::Object(Map::new());
        }
        meta.as_object_mut()?.insert("progressToken".into(), token)
    }

    /// Token of a `notifications/progress` frame.
    pub fn progress_token(&self) -> Option<&Value> {
        if self.method() != Some(METHOD_PROGRESS) {
            return None;
        }
        self.params()?.get("progressToken")
    }

    pub fn set_progress_token(&mut self, token: Value) {
        if let Some(params) = self.body.get_mut("params").and_then(Value::as_object_mut) {
            params.insert("progressToken".into(), token);
            self.raw = None;
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.body.serialize(serializer)
    }
}

/// Correlation ids are issued as JSON numbers.
pub fn correlation_of(id: &Value) -> Option<u64> {
    id.as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_frames_keep_their_bytes() {
        let line = r#"{"jsonrpc":"2.0",  "method":"notifications/message","params":{"b":1,"a":2}}"#;
        let frame = Frame::parse_line(line).unwrap();
        assert_eq!(frame.encode(), line);
    }

    #[test]
    fn id_rewrite_keeps_key_order() {
        let line = r#"{"jsonrpc":"2.0","id":7,"result":{"z":1,"a":2}}"#;
        let mut frame = Frame::parse_line(line).unwrap();
        frame.set_id(json!("client-1"));
        assert_eq!(
            frame.encode(),
            r#"{"jsonrpc":"2.0","id":"client-1","result":{"z":1,"a":2}}"#
        );
    }

    #[test]
    fn rejects_batches_and_garbage() {
        assert!(Frame::parse_line("[]").is_err());
        assert!(Frame::parse_line("42").is_err());
        assert!(Frame::parse_line("{not json").is_err());
        assert!(Frame::parse_line("   ").is_err());
    }

    #[test]
    fn classifies_messages() {
        let req = Frame::request(json!(1), "tools/list", None);
        assert!(req.is_request());
        let note = Frame::notification(METHOD_INITIALIZED, None);
        assert!(note.is_notification());
        let resp = Frame::result(json!(1), json!({}));
        assert!(resp.is_response());
        assert!(!req.is_response());
    }

    #[test]
    fn progress_token_injection_roundtrip() {
        let mut req = Frame::request(json!(1), "tools/call", Some(json!({"name": "x"})));
        assert!(req.set_request_progress_token(json!(99)).is_none());
        assert_eq!(req.request_progress_token(), Some(&json!(99)));

        let previous = req.set_request_progress_token(json!(100));
        assert_eq!(previous, Some(json!(99)));
    }

    #[test]
    fn error_frame_carries_kind() {
        let err = GatewayError::GatewayTimeout { service: "s".into(), timeout_ms: 5 };
        let v = Frame::error(json!("a"), &err).into_value();
        assert_eq!(v["error"]["code"], -32006);
        assert_eq!(v["error"]["data"]["kind"], "GatewayTimeout");
        assert_eq!(v["id"], "a");
    }

    #[test]
    fn idempotency_table() {
        assert!(is_idempotent("tools/list"));
        assert!(!is_idempotent("tools/call"));
    }
}
