//! Public HTTP ingress: routes requests by Host-header subdomain to the
//! owning tunnel session and streams the correlated response back.

use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::{debug, warn};

use burrow_core::frames::{codes, decode_http_body, encode_http_body, RequestPayload};
use burrow_core::TunnelError;

use crate::control::hash_password;
use crate::hooks::TunnelEvent;
use crate::state::AppState;

/// Hop-by-hop headers, stripped in both directions.
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

/// Fallback handler for everything that is not `/tunnel` or `/healthz` on
/// the bare domain.
pub async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let started = Instant::now();

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let Some(subdomain) = extract_subdomain(host, &state.config.domain) else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };

    let method = request.method().to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let client_ip = client_ip(request.headers(), remote_addr);

    let log = |status: StatusCode, bytes_in: u64, bytes_out: u64| {
        state.request_log.record(TunnelEvent::HttpRequest {
            subdomain: subdomain.clone(),
            method: method.clone(),
            path: path.clone(),
            status: status.as_u16(),
            bytes_in,
            bytes_out,
            duration_ms: started.elapsed().as_millis() as u64,
            client_ip: client_ip.to_string(),
            user_agent: user_agent.clone(),
        });
    };

    let Some(session) = state.registry.lookup(&subdomain) else {
        log(StatusCode::BAD_GATEWAY, 0, 0);
        return plain(
            StatusCode::BAD_GATEWAY,
            &format!("{}: no active tunnel for this subdomain", codes::TUNNEL_NOT_FOUND),
        );
    };

    if let Some(hash) = session.password_hash() {
        if !basic_auth_matches(request.headers(), hash) {
            log(StatusCode::UNAUTHORIZED, 0, 0);
            return Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header(header::WWW_AUTHENTICATE, "Basic realm=\"tunnel\"")
                .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .body("tunnel password required".into())
                .unwrap_or_default();
        }
    }

    if !session.ip_allowed(client_ip) {
        log(StatusCode::FORBIDDEN, 0, 0);
        return plain(
            StatusCode::FORBIDDEN,
            &format!("{}: your address is not allowed", codes::IP_BLOCKED),
        );
    }

    let mut headers = BTreeMap::new();
    for (name, value) in request.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
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

    let body = match to_bytes(request.into_body(), state.config.body_cap_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            log(StatusCode::PAYLOAD_TOO_LARGE, 0, 0);
            return plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };
    let bytes_in = body.len() as u64;
    let (body, encoding) = encode_http_body(&body);

    let payload = RequestPayload {
        method: method.clone(),
        path: path.clone(),
        headers,
        body,
        encoding,
    };

    match session
        .dispatch_http(payload, state.config.request_deadline)
        .await
    {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status_code)
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body =
                match decode_http_body(response.body.as_deref(), response.encoding) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(subdomain = %subdomain, error = %e, "undecodable response body");
                        log(StatusCode::BAD_GATEWAY, bytes_in, 0);
                        return plain(StatusCode::BAD_GATEWAY, "bad response from tunnel");
                    }
                };
            let bytes_out = body.len() as u64;

            let mut builder = Response::builder().status(status);
            if let Some(header_map) = builder.headers_mut() {
                for (name, value) in &response.headers {
                    if is_hop_by_hop(name) {
                        continue;
                    }
                    if let (Ok(name), Ok(value)) = (
                        name.parse::<HeaderName>(),
                        HeaderValue::from_str(value),
                    ) {
                        header_map.insert(name, value);
                    }
                }
            }
            log(status, bytes_in, bytes_out);
            builder
                .body(body.into())
                .unwrap_or_else(|_| plain(StatusCode::BAD_GATEWAY, "bad response from tunnel"))
        }
        Err(TunnelError::Timeout) => {
            debug!(subdomain = %subdomain, path = %path, "dispatch deadline exceeded");
            log(StatusCode::GATEWAY_TIMEOUT, bytes_in, 0);
            plain(StatusCode::GATEWAY_TIMEOUT, "tunnel did not respond in time")
        }
        Err(TunnelError::SessionClosed) => {
            log(StatusCode::BAD_GATEWAY, bytes_in, 0);
            plain(
                StatusCode::BAD_GATEWAY,
                &format!("{}: tunnel went away", codes::TUNNEL_DISCONNECTED),
            )
        }
        Err(e) => {
            warn!(subdomain = %subdomain, error = %e, "dispatch failed");
            log(StatusCode::BAD_GATEWAY, bytes_in, 0);
            plain(StatusCode::BAD_GATEWAY, "tunnel dispatch failed")
        }
    }
}

/// The tunnel subdomain addressed by `host`, if any.
///
/// Strips an optional port, requires `host` to end in `.{base}`, and takes
/// the leftmost remaining label.
pub fn extract_subdomain(host: &str, base: &str) -> Option<String> {
    let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
    let host = host.to_ascii_lowercase();
    let base = base.to_ascii_lowercase();
    if host == base {
        return None;
    }
    let prefix = host.strip_suffix(base.as_str())?.strip_suffix('.')?;
    let label = prefix.split('.').next().unwrap_or(prefix);
    if label.is_empty() {
        return None;
    }
    Some(label.to_string())
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Client address: first `X-Forwarded-For` entry when present and
/// parseable, otherwise the socket peer.
fn client_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| remote_addr.ip())
}

/// Verify `Authorization: Basic` credentials against the stored password
/// hash. The username half is ignored; only the password gates access.
fn basic_auth_matches(headers: &HeaderMap, password_hash: &str) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let password = credentials
        .split_once(':')
        .map_or(credentials.as_str(), |(_, p)| p);
    hash_password(password) == password_hash
}

fn plain(status: StatusCode, body: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(body.to_string().into())
        .unwrap_or_default()
}
