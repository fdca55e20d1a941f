//! Control-protocol frames exchanged between agent and broker.
//!
//! Every frame is a UTF-8 JSON object carried as one WebSocket text message.
//! The `"type"` field discriminates the variant; `requestId` / `connectionId`
//! correlate request/response and multiplexed TCP traffic, and `payload`
//! carries the type-specific body. Binary data (TCP bytes, non-UTF-8 HTTP
//! bodies) crosses the wire base64-encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{TunnelError, TunnelResult};

/// Public-facing error codes carried in `error` frames and ingress bodies.
pub mod codes {
    pub const SUBDOMAIN_TAKEN: &str = "SUBDOMAIN_TAKEN";
    pub const SUBDOMAIN_RESERVED: &str = "SUBDOMAIN_RESERVED";
    pub const SUBDOMAIN_INVALID: &str = "SUBDOMAIN_INVALID";
    pub const REGISTRATION_REJECTED: &str = "REGISTRATION_REJECTED";
    pub const REGISTRATION_TIMEOUT: &str = "REGISTRATION_TIMEOUT";
    pub const TUNNEL_NOT_FOUND: &str = "TUNNEL_NOT_FOUND";
    pub const TUNNEL_DISCONNECTED: &str = "TUNNEL_DISCONNECTED";
    pub const IP_BLOCKED: &str = "IP_BLOCKED";
    pub const PORT_EXHAUSTED: &str = "PORT_EXHAUSTED";
    pub const CONNECT_FAILED: &str = "CONNECT_FAILED";
}

/// Tunnel transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// All control-protocol frames.
///
/// Serialized with an internal `"type"` tag in snake_case, e.g.
/// `{"type":"tcp_connect","connectionId":3,"payload":{...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Agent → broker: request a tunnel.
    Register { payload: RegisterPayload },
    /// Broker → agent: tunnel established.
    Registered { payload: RegisteredPayload },
    /// Broker → agent: forward a public HTTP request.
    Request {
        request_id: u64,
        payload: RequestPayload,
    },
    /// Agent → broker: the local service's HTTP response.
    Response {
        request_id: u64,
        payload: ResponsePayload,
    },
    /// Broker → agent: a public TCP client connected.
    TcpConnect {
        connection_id: u64,
        payload: TcpConnectPayload,
    },
    /// Either direction: one chunk of TCP bytes, base64-encoded.
    TcpData {
        connection_id: u64,
        payload: TcpDataPayload,
    },
    /// Either direction: the named sub-connection closed.
    TcpClose { connection_id: u64 },
    /// Either direction: the named sub-connection failed.
    TcpError {
        connection_id: u64,
        payload: TcpErrorPayload,
    },
    /// Agent → broker heartbeat.
    Ping,
    /// Broker → agent heartbeat reply.
    Pong,
    /// Broker → agent: protocol-level failure.
    Error { payload: ErrorPayload },
}

impl Frame {
    /// All wire-level `"type"` tags this implementation understands.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "register",
        "registered",
        "request",
        "response",
        "tcp_connect",
        "tcp_data",
        "tcp_close",
        "tcp_error",
        "ping",
        "pong",
        "error",
    ];

    /// The wire tag of this frame, for logging.
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "register",
            Frame::Registered { .. } => "registered",
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::TcpConnect { .. } => "tcp_connect",
            Frame::TcpData { .. } => "tcp_data",
            Frame::TcpClose { .. } => "tcp_close",
            Frame::TcpError { .. } => "tcp_error",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::Error { .. } => "error",
        }
    }
}

/// `register` payload (agent → broker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    /// Desired subdomain; omitted means "allocate one for me".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

/// `registered` payload (broker → agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub tunnel_id: String,
    pub subdomain: String,
    pub public_url: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
}

/// Marker for how an HTTP body string is encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Base64,
}

/// `request` payload (broker → agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub method: String,
    /// Path plus query string, e.g. `/hello?x=1`.
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<BodyEncoding>,
}

/// `response` payload (agent → broker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<BodyEncoding>,
}

/// `tcp_connect` payload (broker → agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpConnectPayload {
    pub remote_address: String,
    pub remote_port: u16,
    pub local_port: u16,
}

/// `tcp_data` payload: one base64-encoded chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpDataPayload {
    pub data: String,
}

impl TcpDataPayload {
    /// Encode raw bytes for the wire.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BASE64.encode(bytes),
        }
    }

    /// Decode the wire payload back to raw bytes.
    pub fn to_bytes(&self) -> TunnelResult<Vec<u8>> {
        BASE64
            .decode(&self.data)
            .map_err(|e| TunnelError::Codec(format!("invalid base64 tcp data: {e}")))
    }
}

/// `tcp_error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpErrorPayload {
    pub code: String,
    pub message: String,
}

/// `error` payload (broker → agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Encode an HTTP body for a `request`/`response` payload.
///
/// Empty bodies are omitted; valid UTF-8 travels as a raw string; anything
/// else is base64 with `encoding: "base64"`.
pub fn encode_http_body(bytes: &[u8]) -> (Option<String>, Option<BodyEncoding>) {
    if bytes.is_empty() {
        return (None, None);
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (Some(text.to_string()), None),
        Err(_) => (Some(BASE64.encode(bytes)), Some(BodyEncoding::Base64)),
    }
}

/// Decode an HTTP body from a `request`/`response` payload.
pub fn decode_http_body(
    body: Option<&str>,
    encoding: Option<BodyEncoding>,
) -> TunnelResult<Vec<u8>> {
    match (body, encoding) {
        (None, _) => Ok(Vec::new()),
        (Some(text), None) => Ok(text.as_bytes().to_vec()),
        (Some(text), Some(BodyEncoding::Base64)) => BASE64
            .decode(text)
            .map_err(|e| TunnelError::Codec(format!("invalid base64 body: {e}"))),
    }
}
