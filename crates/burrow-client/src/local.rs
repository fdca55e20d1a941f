//! Forwarding `request` frames to the local HTTP service.

use burrow_core::frames::{decode_http_body, encode_http_body, RequestPayload, ResponsePayload};
use burrow_core::{TunnelError, TunnelResult};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Headers never replayed against the local service: hop-by-hop plus the
/// ones the HTTP client computes itself.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// HTTP client for the local service behind this agent.
pub struct LocalHttp {
    client: reqwest::Client,
    base: String,
}

impl LocalHttp {
    pub fn new(host: &str, port: u16, timeout: Duration) -> TunnelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TunnelError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base: format!("http://{host}:{port}"),
        })
    }

    /// Perform the local call for one forwarded request.
    ///
    /// Never fails: any inability to reach or read the local service
    /// synthesizes the bad-gateway response the public client should see.
    pub async fn forward(&self, payload: &RequestPayload) -> ResponsePayload {
        match self.try_forward(payload).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, path = %payload.path, "local request failed");
                bad_gateway()
            }
        }
    }

    async fn try_forward(&self, payload: &RequestPayload) -> TunnelResult<ResponsePayload> {
        let method = reqwest::Method::from_bytes(payload.method.as_bytes())
            .map_err(|e| TunnelError::LocalService(format!("bad method: {e}")))?;
        let url = format!("{}{}", self.base, payload.path);

        let mut request = self.client.request(method, &url);
        for (name, value) in &payload.headers {
            if SKIPPED_REQUEST_HEADERS
                .iter()
                .any(|skip| name.eq_ignore_ascii_case(skip))
            {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        let body = decode_http_body(payload.body.as_deref(), payload.encoding)?;
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TunnelError::LocalService(e.to_string()))?;

        let status_code = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .and_modify(|existing: &mut String| {
                        existing.push_str(", ");
                        existing.push_str(value);
                    })
                    .or_insert_with(|| value.to_string());
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TunnelError::LocalService(e.to_string()))?;
        let (body, encoding) = encode_http_body(&bytes);

        Ok(ResponsePayload {
            status_code,
            headers,
            body,
            encoding,
        })
    }
}

/// The response the public client sees when the local service is down.
fn bad_gateway() -> ResponsePayload {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "text/plain".to_string());
    ResponsePayload {
        status_code: 502,
        headers,
        body: Some("Bad Gateway: Local server not responding".to_string()),
        encoding: None,
    }
}
