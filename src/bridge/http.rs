// MCP Gateway - HTTP passthrough
// Forwards a request to a plain HTTP service and streams the answer back
// untouched (status, headers minus hop-by-hop, chunked bodies).

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, Method, Response};
use futures_util::TryStreamExt;

use crate::error::GatewayError;

/// Never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Request bodies are buffered; responses stream.
const MAX_FORWARD_BODY: usize = 10 * 1024 * 1024;

/// Gateway credentials stay at the gateway.
const STRIPPED_REQUEST: &[&str] = &["authorization", "cookie", crate::auth::CALLER_HEADER];

pub struct ForwardRequest<'a> {
    pub service: &'a str,
    pub base_url: &'a str,
    pub action: &'a str,
    pub query: Option<&'a str>,
    pub method: Method,
    pub headers: &'a HeaderMap,
    pub body: Body,
    /// Deadline for the upstream response head; the body streams unbounded.
    pub timeout: Duration,
}

/// `base_url` + `/` + `action` (+ `?query`).
pub fn upstream_url(base_url: &str, action: &str, query: Option<&str>) -> String {
    let mut url = format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        action.trim_start_matches('/')
    );
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }
    url
}

fn forwardable(name: &HeaderName, extra: &[&str]) -> bool {
    let name = name.as_str();
    !HOP_BY_HOP.contains(&name) && !extra.contains(&name)
}

pub async fn forward(
    client: &reqwest::Client,
    req: ForwardRequest<'_>,
) -> Result<Response<Body>, GatewayError> {
    let url = upstream_url(req.base_url, req.action, req.query);

    let mut headers = HeaderMap::new();
    for (name, value) in req.headers {
        if forwardable(name, STRIPPED_REQUEST) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = axum::body::to_bytes(req.body, MAX_FORWARD_BODY)
        .await
        .map_err(|e| GatewayError::BadRequest(format!("unreadable request body: {e}")))?;
    let send = client
        .request(req.method.clone(), &url)
        .headers(headers)
        .body(body)
        .send();

    let resp = match tokio::time::timeout(req.timeout, send).await {
        Err(_) => {
            return Err(GatewayError::GatewayTimeout {
                service: req.service.to_string(),
                timeout_ms: req.timeout.as_millis() as u64,
            });
        }
        Ok(Err(e)) => {
            tracing::warn!(service = %req.service, "http: forward to {} failed: {}", url, e);
            return Err(GatewayError::ServiceUnavailable {
                service: req.service.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(Ok(resp)) => resp,
    };

    tracing::debug!(
        service = %req.service,
        method = %req.method,
        status = resp.status().as_u16(),
        "http: forwarded to {}",
        url
    );

    let mut builder = Response::builder().status(resp.status());
    if let Some(out) = builder.headers_mut() {
        for (name, value) in resp.headers() {
            if forwardable(name, &[]) {
                out.append(name.clone(), value.clone());
            }
        }
    }
    let stream = resp.bytes_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| GatewayError::MalformedUpstreamFrame {
            service: req.service.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_urls() {
        assert_eq!(
            upstream_url("http://h:1/api/", "/tools/list", None),
            "http://h:1/api/tools/list"
        );
        assert_eq!(
            upstream_url("http://h:1", "mcp", Some("a=1")),
            "http://h:1/mcp?a=1"
        );
        assert_eq!(upstream_url("http://h:1", "", Some("")), "http://h:1/");
    }

    #[test]
    fn hop_by_hop_and_credentials_dropped() {
        let auth = HeaderName::from_static("authorization");
        let conn = HeaderName::from_static("connection");
        let accept = HeaderName::from_static("accept");
        let caller = HeaderName::from_static(crate::auth::CALLER_HEADER);
        assert!(!forwardable(&auth, STRIPPED_REQUEST));
        assert!(!forwardable(&caller, STRIPPED_REQUEST));
        assert!(!forwardable(&conn, &[]));
        assert!(forwardable(&accept, STRIPPED_REQUEST));
        assert!(forwardable(&auth, &[]));
    }
}
