//! Control-channel lifecycle: WebSocket upgrade, REGISTER handshake, and the
//! per-session reader/writer loops.
//!
//! The writer task is the only place frames touch the socket, which gives
//! each session its write serialization. The reader is the only caller of
//! `TunnelSession::handle_frame`.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use burrow_core::frames::{
    codes, ErrorPayload, Frame, Protocol, RegisterPayload, RegisteredPayload,
};
use burrow_core::{decode_frame, encode_frame, TunnelError};

use crate::hooks::{AuthRequest, AuthVerdict};
use crate::session::TunnelSession;
use crate::state::AppState;

/// Depth of the per-session outgoing frame queue.
const OUTGOING_QUEUE_DEPTH: usize = 256;

/// `GET /tunnel` — upgrade to the agent control channel.
pub async fn control_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control(socket, state, remote_addr))
}

/// Hash a tunnel password for storage and comparison.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

async fn handle_control(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    debug!(remote = %remote_addr, "control channel opened");

    // ── REGISTER handshake ───────────────────────────────────────────
    let register = match timeout(
        state.config.register_timeout,
        read_register(&mut ws_stream),
    )
    .await
    {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            debug!(remote = %remote_addr, "channel closed before register");
            return;
        }
        Err(_) => {
            reject(
                &mut ws_sink,
                codes::REGISTRATION_TIMEOUT,
                "no register frame received in time",
            )
            .await;
            return;
        }
    };

    let protocol = register.protocol.unwrap_or(Protocol::Http);
    let mut subdomain = match state.registry.resolve_subdomain(register.subdomain.as_deref()) {
        Ok(subdomain) => subdomain,
        Err(e) => {
            let (code, message) = registration_error(&e);
            reject(&mut ws_sink, code, &message).await;
            return;
        }
    };

    let verdict = state
        .authorizer
        .authorize(&AuthRequest {
            subdomain: &subdomain,
            protocol: &protocol.to_string(),
            has_password: register.password.is_some(),
            remote_addr: &remote_addr.ip().to_string(),
        })
        .await;
    let ip_allow_list = match verdict {
        AuthVerdict::Accept { ip_allow_list } => ip_allow_list,
        AuthVerdict::Reject { reason } => {
            reject(&mut ws_sink, codes::REGISTRATION_REJECTED, &reason).await;
            return;
        }
        AuthVerdict::Reassign => {
            subdomain = match state.registry.resolve_subdomain(None) {
                Ok(subdomain) => subdomain,
                Err(e) => {
                    let (code, message) = registration_error(&e);
                    reject(&mut ws_sink, code, &message).await;
                    return;
                }
            };
            Vec::new()
        }
    };

    // TCP tunnels get their public listener before the reply, so the
    // registered frame can carry the allocated port.
    let bound = if protocol == Protocol::Tcp {
        match state.tcp.bind().await {
            Ok(bound) => Some(bound),
            Err(e) => {
                reject(&mut ws_sink, codes::PORT_EXHAUSTED, &e.to_string()).await;
                return;
            }
        }
    } else {
        None
    };
    let tcp_port = bound.as_ref().map(|(port, _)| *port);

    let tunnel_id = Uuid::new_v4().to_string();
    let (out_tx, out_rx) = mpsc::channel::<Frame>(OUTGOING_QUEUE_DEPTH);
    let session = Arc::new(TunnelSession::new(
        tunnel_id.clone(),
        subdomain.clone(),
        protocol,
        tcp_port,
        register.password.as_deref().map(hash_password),
        ip_allow_list,
        out_tx.clone(),
    ));

    let public_url = match protocol {
        Protocol::Http => state.config.http_public_url(&subdomain),
        Protocol::Tcp => state.config.tcp_public_url(tcp_port.unwrap_or(0)),
    };
    let registered = Frame::Registered {
        payload: RegisteredPayload {
            tunnel_id: tunnel_id.clone(),
            subdomain: subdomain.clone(),
            public_url: public_url.clone(),
            protocol,
            tcp_port,
        },
    };
    // Queued before the registry insert so no dispatched request can ever
    // precede the registered frame on the wire.
    let _ = out_tx.send(registered).await;

    if let Err(e) = state.registry.insert(session.clone()) {
        if let Some((port, listener)) = bound {
            drop(listener);
            state.tcp.release(port);
        }
        let (code, message) = registration_error(&e);
        reject(&mut ws_sink, code, &message).await;
        return;
    }

    let writer = tokio::spawn(write_loop(ws_sink, out_rx));

    let tcp_handle = bound.map(|(port, listener)| {
        state.tcp.spawn_accept_loop(
            listener,
            port,
            session.clone(),
            state.request_log.clone(),
        )
    });

    info!(
        tunnel = %tunnel_id,
        subdomain = %subdomain,
        public_url = %public_url,
        remote = %remote_addr,
        "agent connected"
    );

    // ── Serve until the channel dies or goes silent ──────────────────
    read_loop(&mut ws_stream, &session, &state).await;

    // ── Teardown ─────────────────────────────────────────────────────
    state.registry.unregister(&tunnel_id);
    if let Some(handle) = tcp_handle {
        handle.shutdown().await;
    }
    session.close();
    writer.abort();
    info!(
        tunnel = %tunnel_id,
        subdomain = %subdomain,
        uptime_secs = session.age().as_secs(),
        "agent disconnected"
    );
}

/// Wait for the agent's `register` frame, skipping anything else.
async fn read_register(stream: &mut SplitStream<WebSocket>) -> Option<RegisterPayload> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match decode_frame(text.as_str()) {
                Ok(Frame::Register { payload }) => return Some(payload),
                Ok(frame) => {
                    debug!(frame = frame.frame_type(), "ignoring pre-register frame")
                }
                Err(e) => debug!(error = %e, "ignoring undecodable pre-register message"),
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

/// Drain the session's outgoing queue onto the socket.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = out_rx.recv().await {
        let text = match encode_frame(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode outgoing frame");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    debug!("control writer ended");
}

/// Consume incoming frames until close, error, or idle expiry.
async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    session: &Arc<TunnelSession>,
    state: &AppState,
) {
    loop {
        match timeout(state.config.idle_timeout, stream.next()).await {
            Err(_) => {
                warn!(
                    tunnel = %session.tunnel_id(),
                    idle_secs = state.config.idle_timeout.as_secs(),
                    "control channel silent too long, closing"
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(tunnel = %session.tunnel_id(), error = %e, "control read error");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => match decode_frame(text.as_str()) {
                Ok(frame) => session.handle_frame(frame).await,
                Err(TunnelError::UnknownFrameType(tag)) => {
                    warn!(frame = %tag, "ignoring unknown frame type");
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame");
                }
            },
            Ok(Some(Ok(Message::Close(_)))) => break,
            // Binary frames are not part of the protocol; ping/pong are
            // answered by the websocket layer itself.
            Ok(Some(Ok(_))) => {}
        }
    }
}

/// Send an `error` frame and close the channel (registration failures).
async fn reject(sink: &mut SplitSink<WebSocket, Message>, code: &str, message: &str) {
    warn!(code, message, "registration failed");
    let frame = Frame::Error {
        payload: ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        },
    };
    if let Ok(text) = encode_frame(&frame) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
    let _ = sink.close().await;
}

/// Map a registration-path error to its wire code and message.
fn registration_error(e: &TunnelError) -> (&'static str, String) {
    match e {
        TunnelError::SubdomainTaken(s) => {
            (codes::SUBDOMAIN_TAKEN, format!("subdomain \"{s}\" is taken"))
        }
        TunnelError::ReservedSubdomain(s) => (
            codes::SUBDOMAIN_RESERVED,
            format!("subdomain \"{s}\" is reserved"),
        ),
        TunnelError::InvalidSubdomain(msg) => (codes::SUBDOMAIN_INVALID, msg.clone()),
        other => (codes::REGISTRATION_REJECTED, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_is_stable_sha256_hex() {
        assert_eq!(
            hash_password("secret"),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
        assert_ne!(hash_password("secret"), hash_password("other"));
    }

    #[test]
    fn registration_errors_map_to_codes() {
        let (code, _) = registration_error(&TunnelError::SubdomainTaken("demo".into()));
        assert_eq!(code, codes::SUBDOMAIN_TAKEN);
        let (code, _) = registration_error(&TunnelError::ReservedSubdomain("www".into()));
        assert_eq!(code, codes::SUBDOMAIN_RESERVED);
        let (code, _) = registration_error(&TunnelError::InvalidSubdomain("ab".into()));
        assert_eq!(code, codes::SUBDOMAIN_INVALID);
    }
}
