//! The agent control loop.
//!
//! `Agent::start` dials the broker, performs the REGISTER handshake, and
//! spawns the serve loop: inbound `request` frames become local HTTP calls,
//! `tcp_*` frames drive local TCP sub-connections, and a heartbeat task
//! pings the broker. An unexpected channel drop triggers reconnection with
//! exponential backoff; `close()` ends the tunnel cleanly.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use burrow_core::frames::{
    codes, Frame, RegisterPayload, TcpConnectPayload, TcpErrorPayload,
};
use burrow_core::{decode_frame, encode_frame, TunnelError, TunnelResult};

use crate::backoff::reconnect_delay;
use crate::config::AgentConfig;
use crate::events::{AgentEvent, TunnelInfo};
use crate::local::LocalHttp;
use crate::tls;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnMap = Arc<Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>>;

/// Depth of the outgoing frame queue and of each local-connection byte queue.
const OUTGOING_QUEUE_DEPTH: usize = 256;
const TCP_CONN_QUEUE_DEPTH: usize = 32;

/// Read-chunk bound on the local→broker path.
const CHUNK_SIZE: usize = 64 * 1024;

/// How the agent's run loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOutcome {
    /// `close()` was called; the tunnel was dropped deliberately.
    Closed,
    /// Reconnection attempts were exhausted.
    ReconnectFailed,
}

/// A running tunnel agent.
#[derive(Debug)]
pub struct Agent {
    closed: Arc<AtomicBool>,
    interrupt: Arc<Notify>,
    handle: tokio::task::JoinHandle<AgentOutcome>,
}

/// Detached handle that can close the agent from another task.
#[derive(Clone)]
pub struct AgentCloser {
    closed: Arc<AtomicBool>,
    interrupt: Arc<Notify>,
}

impl AgentCloser {
    /// Drop the tunnel cleanly. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.interrupt.notify_waiters();
            // Also store a permit for a waiter that has not polled yet.
            self.interrupt.notify_one();
        }
    }
}

impl Agent {
    /// Dial the broker, register, and start serving.
    ///
    /// Returns the assigned tunnel info and the event stream. Registration
    /// failures (bad config, unreachable broker, rejected subdomain,
    /// handshake timeout) surface here; after this point failures go through
    /// the reconnect policy instead.
    pub async fn start(
        config: AgentConfig,
    ) -> TunnelResult<(Self, TunnelInfo, mpsc::Receiver<AgentEvent>)> {
        let local = Arc::new(LocalHttp::new(
            &config.local_host,
            config.local_port,
            config.local_request_timeout,
        )?);

        let (ws, info) = connect_and_register(&config, config.subdomain.as_deref()).await?;

        let (event_tx, event_rx) = mpsc::channel(64);
        let _ = event_tx.send(AgentEvent::Connected(info.clone())).await;

        let closed = Arc::new(AtomicBool::new(false));
        let interrupt = Arc::new(Notify::new());
        let handle = tokio::spawn(run_loop(
            config,
            local,
            ws,
            event_tx,
            closed.clone(),
            interrupt.clone(),
        ));

        Ok((
            Self {
                closed,
                interrupt,
                handle,
            },
            info,
            event_rx,
        ))
    }

    /// Drop the tunnel cleanly. Idempotent.
    pub fn close(&self) {
        self.closer().close();
    }

    /// A handle that can close this agent from another task.
    pub fn closer(&self) -> AgentCloser {
        AgentCloser {
            closed: self.closed.clone(),
            interrupt: self.interrupt.clone(),
        }
    }

    /// Wait for the run loop to finish.
    pub async fn wait(&mut self) -> AgentOutcome {
        (&mut self.handle).await.unwrap_or(AgentOutcome::Closed)
    }
}

// ── Connection establishment ─────────────────────────────────────────

/// Dial the control endpoint and complete the REGISTER handshake.
async fn connect_and_register(
    config: &AgentConfig,
    desired_subdomain: Option<&str>,
) -> TunnelResult<(WsStream, TunnelInfo)> {
    let url = config.control_url()?;
    let connector = tls::build_connector(config.insecure, config.ca_path.as_deref())?;

    let (mut ws, _response) =
        connect_async_tls_with_config(url.as_str(), None, false, Some(connector))
            .await
            .map_err(|e| TunnelError::Transport(format!("dial {url}: {e}")))?;
    debug!(url = %url, "control channel connected");

    let register = Frame::Register {
        payload: RegisterPayload {
            subdomain: desired_subdomain.map(str::to_string),
            local_port: config.local_port,
            local_host: Some(config.local_host.clone()),
            password: config.password.clone(),
            protocol: Some(config.protocol),
        },
    };
    ws.send(Message::Text(encode_frame(&register)?))
        .await
        .map_err(|e| TunnelError::Transport(format!("send register: {e}")))?;

    match timeout(config.register_timeout, read_registered(&mut ws)).await {
        Ok(result) => result.map(|info| (ws, info)),
        Err(_) => Err(TunnelError::RegistrationTimeout),
    }
}

/// Read frames until `registered` (or a registration `error`) arrives.
async fn read_registered(ws: &mut WsStream) -> TunnelResult<TunnelInfo> {
    while let Some(message) = ws.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                return Err(TunnelError::Transport("closed during registration".into()))
            }
            Ok(_) => continue,
            Err(e) => return Err(TunnelError::Transport(e.to_string())),
        };
        match decode_frame(&text) {
            Ok(Frame::Registered { payload }) => {
                return Ok(TunnelInfo {
                    tunnel_id: payload.tunnel_id,
                    subdomain: payload.subdomain,
                    public_url: payload.public_url,
                    protocol: payload.protocol,
                    tcp_port: payload.tcp_port,
                });
            }
            Ok(Frame::Error { payload }) => {
                return Err(match payload.code.as_str() {
                    codes::SUBDOMAIN_TAKEN => TunnelError::SubdomainTaken(payload.message),
                    _ => TunnelError::RegistrationRejected(format!(
                        "{}: {}",
                        payload.code, payload.message
                    )),
                });
            }
            Ok(frame) => debug!(frame = frame.frame_type(), "ignoring pre-registered frame"),
            Err(e) => debug!(error = %e, "ignoring undecodable message during registration"),
        }
    }
    Err(TunnelError::Transport("closed during registration".into()))
}

// ── Run loop with reconnection ───────────────────────────────────────

async fn run_loop(
    config: AgentConfig,
    local: Arc<LocalHttp>,
    first_ws: WsStream,
    events: mpsc::Sender<AgentEvent>,
    closed: Arc<AtomicBool>,
    interrupt: Arc<Notify>,
) -> AgentOutcome {
    let mut ws = Some(first_ws);

    loop {
        if let Some(current) = ws.take() {
            serve_session(current, &config, &local, &events, &interrupt).await;
        }
        if closed.load(Ordering::Acquire) {
            return AgentOutcome::Closed;
        }
        let _ = events.send(AgentEvent::Disconnected).await;

        // This loop is the sole path back to a live channel, which is what
        // keeps reconnection attempts single-flight.
        let max = config.reconnect.max_attempts;
        let mut attempts: u32 = 0;
        loop {
            if attempts >= max {
                let _ = events.send(AgentEvent::ReconnectFailed { attempts }).await;
                return AgentOutcome::ReconnectFailed;
            }
            let delay = reconnect_delay(attempts, &config.reconnect);
            let _ = events
                .send(AgentEvent::Reconnecting {
                    attempt: attempts + 1,
                    max,
                    delay,
                })
                .await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = interrupt.notified() => {}
            }
            if closed.load(Ordering::Acquire) {
                return AgentOutcome::Closed;
            }

            attempts += 1;
            match reconnect_once(&config).await {
                Ok((new_ws, info)) => {
                    info!(public_url = %info.public_url, "reconnected");
                    let _ = events.send(AgentEvent::Reconnected(info)).await;
                    ws = Some(new_ws);
                    break;
                }
                Err(e) => {
                    warn!(attempt = attempts, max, error = %e, "reconnect attempt failed");
                }
            }
        }
    }
}

/// One reconnect attempt. A `SUBDOMAIN_TAKEN` rejection of the original
/// subdomain is not fatal: the broker is asked for a random one instead,
/// and callers observe the new public URL via `Reconnected`.
async fn reconnect_once(config: &AgentConfig) -> TunnelResult<(WsStream, TunnelInfo)> {
    match connect_and_register(config, config.subdomain.as_deref()).await {
        Err(TunnelError::SubdomainTaken(_)) if config.subdomain.is_some() => {
            info!(
                subdomain = config.subdomain.as_deref().unwrap_or_default(),
                "subdomain no longer available, accepting a reassigned one"
            );
            connect_and_register(config, None).await
        }
        other => other,
    }
}

// ── Serving one live session ─────────────────────────────────────────

/// Shared context for frame handling within one session.
struct ServeCtx {
    out_tx: mpsc::Sender<Frame>,
    conns: ConnMap,
    local: Arc<LocalHttp>,
    events: mpsc::Sender<AgentEvent>,
    local_host: String,
    local_port: u16,
}

async fn serve_session(
    ws: WsStream,
    config: &AgentConfig,
    local: &Arc<LocalHttp>,
    events: &mpsc::Sender<AgentEvent>,
    interrupt: &Arc<Notify>,
) {
    let (sink, mut stream) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<Frame>(OUTGOING_QUEUE_DEPTH);
    let writer = tokio::spawn(write_loop(sink, out_rx));

    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let heartbeat_dead = Arc::new(Notify::new());
    let heartbeat = {
        let out_tx = out_tx.clone();
        let last_pong = last_pong.clone();
        let heartbeat_dead = heartbeat_dead.clone();
        let interval = config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick
            loop {
                ticker.tick().await;
                let silence = last_pong.lock().expect("pong clock poisoned").elapsed();
                if silence > interval * 3 {
                    warn!(
                        silence_secs = silence.as_secs(),
                        "no pong from broker, treating channel as dead"
                    );
                    heartbeat_dead.notify_waiters();
                    break;
                }
                if out_tx.send(Frame::Ping).await.is_err() {
                    break;
                }
            }
        })
    };

    let ctx = ServeCtx {
        out_tx,
        conns: Arc::new(Mutex::new(HashMap::new())),
        local: local.clone(),
        events: events.clone(),
        local_host: config.local_host.clone(),
        local_port: config.local_port,
    };

    loop {
        tokio::select! {
            _ = interrupt.notified() => {
                debug!("session interrupted by close()");
                break;
            }
            _ = heartbeat_dead.notified() => break,
            message = stream.next() => {
                match message {
                    None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "control read error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if !handle_text(&ctx, &last_pong, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Dropping the per-connection senders ends every local relay.
    ctx.conns.lock().expect("conn table poisoned").clear();
    heartbeat.abort();
    writer.abort();
    debug!("session ended");
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
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
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}

/// Dispatch one inbound text message. Returns `false` when the session must
/// end (fatal `error` frame).
async fn handle_text(ctx: &ServeCtx, last_pong: &Arc<Mutex<Instant>>, text: &str) -> bool {
    let frame = match decode_frame(text) {
        Ok(frame) => frame,
        Err(TunnelError::UnknownFrameType(tag)) => {
            warn!(frame = %tag, "ignoring unknown frame type");
            return true;
        }
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            return true;
        }
    };

    match frame {
        Frame::Request {
            request_id,
            payload,
        } => {
            let local = ctx.local.clone();
            let out_tx = ctx.out_tx.clone();
            let events = ctx.events.clone();
            tokio::spawn(async move {
                let method = payload.method.clone();
                let path = payload.path.clone();
                let response = local.forward(&payload).await;
                let _ = events
                    .send(AgentEvent::Request {
                        method,
                        path,
                        status: response.status_code,
                    })
                    .await;
                let _ = out_tx
                    .send(Frame::Response {
                        request_id,
                        payload: response,
                    })
                    .await;
            });
        }
        Frame::TcpConnect {
            connection_id,
            payload,
        } => {
            let out_tx = ctx.out_tx.clone();
            let conns = ctx.conns.clone();
            let events = ctx.events.clone();
            let host = ctx.local_host.clone();
            let port = ctx.local_port;
            tokio::spawn(async move {
                run_tcp_connection(connection_id, payload, host, port, out_tx, conns, events)
                    .await;
            });
        }
        Frame::TcpData {
            connection_id,
            payload,
        } => {
            let bytes = match payload.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(connection_id, error = %e, "dropping undecodable tcp_data");
                    return true;
                }
            };
            let tx = ctx
                .conns
                .lock()
                .expect("conn table poisoned")
                .get(&connection_id)
                .cloned();
            match tx {
                Some(tx) => {
                    if tx.send(bytes).await.is_err() {
                        debug!(connection_id, "local side gone, tcp_data dropped");
                    }
                }
                None => debug!(connection_id, "tcp_data for unknown connection"),
            }
        }
        Frame::TcpClose { connection_id } => {
            ctx.conns
                .lock()
                .expect("conn table poisoned")
                .remove(&connection_id);
        }
        Frame::TcpError {
            connection_id,
            payload,
        } => {
            warn!(
                connection_id,
                code = %payload.code,
                message = %payload.message,
                "broker reported tcp error"
            );
            ctx.conns
                .lock()
                .expect("conn table poisoned")
                .remove(&connection_id);
        }
        Frame::Pong => {
            *last_pong.lock().expect("pong clock poisoned") = Instant::now();
        }
        Frame::Error { payload } => {
            warn!(code = %payload.code, message = %payload.message, "fatal broker error");
            return false;
        }
        other => {
            debug!(frame = other.frame_type(), "ignoring unexpected frame");
        }
    }
    true
}

/// Run one multiplexed TCP sub-connection against the local service.
async fn run_tcp_connection(
    connection_id: u64,
    connect: TcpConnectPayload,
    local_host: String,
    local_port: u16,
    out_tx: mpsc::Sender<Frame>,
    conns: ConnMap,
    events: mpsc::Sender<AgentEvent>,
) {
    debug!(
        connection_id,
        remote = %connect.remote_address,
        remote_port = connect.remote_port,
        "opening local tcp connection"
    );
    let stream = match TcpStream::connect((local_host.as_str(), local_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(connection_id, error = %e, "local tcp connect failed");
            let _ = out_tx
                .send(Frame::TcpError {
                    connection_id,
                    payload: TcpErrorPayload {
                        code: codes::CONNECT_FAILED.to_string(),
                        message: e.to_string(),
                    },
                })
                .await;
            let _ = out_tx.send(Frame::TcpClose { connection_id }).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(TCP_CONN_QUEUE_DEPTH);
    conns
        .lock()
        .expect("conn table poisoned")
        .insert(connection_id, tx);
    let _ = events.send(AgentEvent::TcpOpened { connection_id }).await;

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        tokio::select! {
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        let frame = Frame::TcpData {
                            connection_id,
                            payload: burrow_core::frames::TcpDataPayload::from_bytes(&buf[..n]),
                        };
                        if out_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(connection_id, error = %e, "local read error");
                        break;
                    }
                }
            }
            chunk = rx.recv() => {
                match chunk {
                    Some(data) => {
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    // Broker sent tcp_close, or the session ended.
                    None => break,
                }
            }
        }
    }

    let _ = write_half.shutdown().await;
    // Exactly one tcp_close per side: only the party still in the table
    // announces the close.
    let was_open = conns
        .lock()
        .expect("conn table poisoned")
        .remove(&connection_id)
        .is_some();
    if was_open {
        let _ = out_tx.send(Frame::TcpClose { connection_id }).await;
    }
    let _ = events.send(AgentEvent::TcpClosed { connection_id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::frames::{Protocol, RegisteredPayload};
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Accept one control connection and answer the register handshake.
    /// Returns the bound port and a handle yielding the server-side socket.
    async fn fake_broker(
        subdomain: &'static str,
    ) -> (
        u16,
        tokio::task::JoinHandle<WebSocketStream<TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            let register = loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => break decode_frame(&text).unwrap(),
                    _ => continue,
                }
            };
            let Frame::Register { payload } = register else {
                panic!("expected register frame");
            };
            assert!(payload.local_port > 0);

            let registered = Frame::Registered {
                payload: RegisteredPayload {
                    tunnel_id: "t-test".into(),
                    subdomain: subdomain.into(),
                    public_url: format!("https://{subdomain}.tunnel.test"),
                    protocol: Protocol::Http,
                    tcp_port: None,
                },
            };
            ws.send(Message::Text(encode_frame(&registered).unwrap()))
                .await
                .unwrap();
            ws
        });
        (port, handle)
    }

    fn test_config(port: u16) -> AgentConfig {
        AgentConfig {
            server_url: format!("ws://127.0.0.1:{port}"),
            reconnect: crate::config::ReconnectConfig {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                jitter_factor: 0.30,
                max_attempts: 2,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn registers_and_reports_tunnel_info() {
        let (port, broker) = fake_broker("demo").await;
        let (mut agent, info, mut events) = Agent::start(test_config(port)).await.unwrap();

        assert_eq!(info.subdomain, "demo");
        assert_eq!(info.public_url, "https://demo.tunnel.test");
        match events.recv().await.unwrap() {
            AgentEvent::Connected(connected) => assert_eq!(connected.subdomain, "demo"),
            other => panic!("expected connected event, got {other:?}"),
        }

        let _server_ws = broker.await.unwrap();
        agent.close();
        assert_eq!(agent.wait().await, AgentOutcome::Closed);
    }

    #[tokio::test]
    async fn forwards_request_and_synthesizes_502_when_local_down() {
        let (port, broker) = fake_broker("demo").await;
        let mut config = test_config(port);
        // Point at a dead local port so the agent synthesizes a 502.
        config.local_port = 1;
        config.local_request_timeout = Duration::from_millis(500);

        let (mut agent, _info, mut events) = Agent::start(config).await.unwrap();
        let _ = events.recv().await; // connected

        let mut server_ws = broker.await.unwrap();
        let request = Frame::Request {
            request_id: 1,
            payload: burrow_core::frames::RequestPayload {
                method: "GET".into(),
                path: "/hello".into(),
                headers: Default::default(),
                body: None,
                encoding: None,
            },
        };
        server_ws
            .send(Message::Text(encode_frame(&request).unwrap()))
            .await
            .unwrap();

        let response = loop {
            match server_ws.next().await.unwrap().unwrap() {
                Message::Text(text) => match decode_frame(&text).unwrap() {
                    Frame::Response {
                        request_id,
                        payload,
                    } => {
                        assert_eq!(request_id, 1);
                        break payload;
                    }
                    Frame::Ping => continue,
                    other => panic!("unexpected frame {other:?}"),
                },
                _ => continue,
            }
        };
        assert_eq!(response.status_code, 502);
        assert_eq!(
            response.body.as_deref(),
            Some("Bad Gateway: Local server not responding")
        );

        match events.recv().await.unwrap() {
            AgentEvent::Request { status, .. } => assert_eq!(status, 502),
            other => panic!("expected request event, got {other:?}"),
        }

        agent.close();
        assert_eq!(agent.wait().await, AgentOutcome::Closed);
    }

    #[tokio::test]
    async fn reconnect_exhaustion_reports_failure() {
        let (port, broker) = fake_broker("demo").await;
        let (mut agent, _info, mut events) = Agent::start(test_config(port)).await.unwrap();
        let _ = events.recv().await; // connected

        // Kill the broker side; nothing will be listening for reconnects.
        let server_ws = broker.await.unwrap();
        drop(server_ws);

        let mut saw_disconnected = false;
        let mut saw_reconnecting = false;
        loop {
            match events.recv().await.unwrap() {
                AgentEvent::Disconnected => saw_disconnected = true,
                AgentEvent::Reconnecting { attempt, max, .. } => {
                    assert!(attempt >= 1 && attempt <= max);
                    saw_reconnecting = true;
                }
                AgentEvent::ReconnectFailed { attempts } => {
                    assert_eq!(attempts, 2);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_disconnected);
        assert!(saw_reconnecting);
        assert_eq!(agent.wait().await, AgentOutcome::ReconnectFailed);
    }

    #[tokio::test]
    async fn reconnect_accepts_reassigned_subdomain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let registered = |subdomain: &str| Frame::Registered {
            payload: RegisteredPayload {
                tunnel_id: "t-test".into(),
                subdomain: subdomain.into(),
                public_url: format!("https://{subdomain}.tunnel.test"),
                protocol: Protocol::Http,
                tcp_port: None,
            },
        };

        let broker = tokio::spawn(async move {
            // First connection: accept the desired subdomain, then drop the
            // channel mid-session.
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let _ = ws.next().await;
            ws.send(Message::Text(
                encode_frame(&registered("apple-tunnel-7")).unwrap(),
            ))
            .await
            .unwrap();
            drop(ws);

            // Reconnect: someone else now owns the subdomain.
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let register = loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => break decode_frame(&text).unwrap(),
                    _ => continue,
                }
            };
            let Frame::Register { payload } = register else {
                panic!("expected register frame");
            };
            assert_eq!(payload.subdomain.as_deref(), Some("apple-tunnel-7"));
            ws.send(Message::Text(
                encode_frame(&Frame::Error {
                    payload: burrow_core::frames::ErrorPayload {
                        code: codes::SUBDOMAIN_TAKEN.into(),
                        message: "subdomain \"apple-tunnel-7\" is taken".into(),
                    },
                })
                .unwrap(),
            ))
            .await
            .unwrap();

            // The agent redials at once without a desired subdomain.
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let register = loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => break decode_frame(&text).unwrap(),
                    _ => continue,
                }
            };
            let Frame::Register { payload } = register else {
                panic!("expected register frame");
            };
            assert!(payload.subdomain.is_none());
            ws.send(Message::Text(
                encode_frame(&registered("witty-otter-42")).unwrap(),
            ))
            .await
            .unwrap();
            ws
        });

        let mut config = test_config(port);
        config.subdomain = Some("apple-tunnel-7".into());
        let (mut agent, info, mut events) = Agent::start(config).await.unwrap();
        assert_eq!(info.subdomain, "apple-tunnel-7");

        loop {
            match events.recv().await.unwrap() {
                AgentEvent::Reconnected(info) => {
                    assert_eq!(info.subdomain, "witty-otter-42");
                    assert_eq!(info.public_url, "https://witty-otter-42.tunnel.test");
                    break;
                }
                AgentEvent::ReconnectFailed { .. } => panic!("reconnect should succeed"),
                _ => {}
            }
        }

        let _server_ws = broker.await.unwrap();
        agent.close();
        assert_eq!(agent.wait().await, AgentOutcome::Closed);
    }

    #[tokio::test]
    async fn registration_error_surfaces_at_start() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let _ = ws.next().await; // register
            let error = Frame::Error {
                payload: burrow_core::frames::ErrorPayload {
                    code: codes::SUBDOMAIN_TAKEN.into(),
                    message: "subdomain \"demo\" is taken".into(),
                },
            };
            ws.send(Message::Text(encode_frame(&error).unwrap()))
                .await
                .unwrap();
        });

        let mut config = test_config(port);
        config.subdomain = Some("demo".into());
        let err = Agent::start(config).await.unwrap_err();
        assert!(matches!(err, TunnelError::SubdomainTaken(_)));
    }
}
