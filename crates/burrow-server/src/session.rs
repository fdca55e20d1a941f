//! Broker-side tunnel session.
//!
//! One `TunnelSession` exists per connected agent. It exclusively owns the
//! control channel's outgoing queue, the pending-request table, and the
//! multiplexed-TCP-connection table. The control reader (in `control`) is the
//! only caller of [`TunnelSession::handle_frame`]; ingress and the TCP
//! listener interact through `dispatch_http` / `open_tcp_connection` /
//! `write_tcp` / `close_tcp`.

use burrow_core::frames::{
    Frame, Protocol, RequestPayload, ResponsePayload, TcpConnectPayload, TcpDataPayload,
};
use burrow_core::{TunnelError, TunnelResult};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Depth of the per-connection agent→public byte queue. Bounded so a slow
/// public reader backpressures the control-channel reader.
const TCP_CONN_QUEUE_DEPTH: usize = 32;

/// Per-tunnel counters, updated atomically from the data paths.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub requests: AtomicU64,
    pub tcp_connections: AtomicU64,
    /// Bytes flowing public→agent.
    pub bytes_in: AtomicU64,
    /// Bytes flowing agent→public.
    pub bytes_out: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub tcp_connections: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Broker-side state for one registered tunnel.
pub struct TunnelSession {
    tunnel_id: String,
    subdomain: String,
    protocol: Protocol,
    tcp_port: Option<u16>,
    password_hash: Option<String>,
    ip_allow_list: Vec<IpNet>,
    created_at: Instant,
    stats: SessionStats,
    /// Single writer queue; the control writer task is the only consumer,
    /// which serializes all frame writes on the channel.
    outgoing: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ResponsePayload>>>,
    next_request_id: AtomicU64,
    tcp_conns: Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    next_connection_id: AtomicU64,
    closed: AtomicBool,
}

/// Removes a pending-request entry when its dispatcher goes away without a
/// resolution (deadline hit, or the ingress handler was dropped because the
/// public client disconnected). A late `response` then finds no entry and is
/// discarded.
struct PendingGuard<'a> {
    session: &'a TunnelSession,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.session.pending.lock() {
            pending.remove(&self.request_id);
        }
    }
}

impl TunnelSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tunnel_id: String,
        subdomain: String,
        protocol: Protocol,
        tcp_port: Option<u16>,
        password_hash: Option<String>,
        ip_allow_list: Vec<IpNet>,
        outgoing: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            tunnel_id,
            subdomain,
            protocol,
            tcp_port,
            password_hash,
            ip_allow_list,
            created_at: Instant::now(),
            stats: SessionStats::default(),
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            tcp_conns: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn tcp_port(&self) -> Option<u16> {
        self.tcp_port
    }

    pub fn password_hash(&self) -> Option<&str> {
        self.password_hash.as_deref()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            tcp_connections: self.stats.tcp_connections.load(Ordering::Relaxed),
            bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.stats.bytes_out.load(Ordering::Relaxed),
        }
    }

    /// Whether `ip` passes this tunnel's allow list. An empty list admits
    /// any address.
    pub fn ip_allowed(&self, ip: IpAddr) -> bool {
        if self.ip_allow_list.is_empty() {
            return true;
        }
        self.ip_allow_list.iter().any(|net| net.contains(&ip))
    }

    // ── HTTP request correlation ─────────────────────────────────────

    /// Forward one public HTTP request to the agent and await the correlated
    /// `response` frame.
    ///
    /// Resolves exactly once per request id: with the agent's response, with
    /// [`TunnelError::Timeout`] when `deadline` passes, or with
    /// [`TunnelError::SessionClosed`] when the control channel goes away.
    pub async fn dispatch_http(
        &self,
        payload: RequestPayload,
        deadline: Duration,
    ) -> TunnelResult<ResponsePayload> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending table poisoned")
            .insert(request_id, tx);
        let _guard = PendingGuard {
            session: self,
            request_id,
        };

        let body_len = payload.body.as_deref().map(str::len).unwrap_or(0) as u64;
        if self
            .outgoing
            .send(Frame::Request {
                request_id,
                payload,
            })
            .await
            .is_err()
        {
            return Err(TunnelError::SessionClosed);
        }
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_in.fetch_add(body_len, Ordering::Relaxed);

        tokio::select! {
            res = rx => match res {
                Ok(response) => {
                    let out = response.body.as_deref().map(str::len).unwrap_or(0) as u64;
                    self.stats.bytes_out.fetch_add(out, Ordering::Relaxed);
                    Ok(response)
                }
                // Sender dropped without a value: the session was closed.
                Err(_) => Err(TunnelError::SessionClosed),
            },
            _ = tokio::time::sleep(deadline) => {
                debug!(
                    tunnel = %self.tunnel_id,
                    request_id,
                    "request deadline expired"
                );
                Err(TunnelError::Timeout)
            }
        }
    }

    // ── TCP multiplexing ─────────────────────────────────────────────

    /// Open a multiplexed sub-connection for a freshly accepted public
    /// socket. Returns the connection id and the receiver for agent→public
    /// bytes.
    pub async fn open_tcp_connection(
        &self,
        remote_addr: SocketAddr,
    ) -> TunnelResult<(u64, mpsc::Receiver<Vec<u8>>)> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        let local_port = self.tcp_port.unwrap_or(0);

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(TCP_CONN_QUEUE_DEPTH);
        self.tcp_conns
            .lock()
            .expect("tcp table poisoned")
            .insert(connection_id, tx);

        let frame = Frame::TcpConnect {
            connection_id,
            payload: TcpConnectPayload {
                remote_address: remote_addr.ip().to_string(),
                remote_port: remote_addr.port(),
                local_port,
            },
        };
        if self.outgoing.send(frame).await.is_err() {
            self.tcp_conns
                .lock()
                .expect("tcp table poisoned")
                .remove(&connection_id);
            return Err(TunnelError::SessionClosed);
        }

        self.stats.tcp_connections.fetch_add(1, Ordering::Relaxed);
        Ok((connection_id, rx))
    }

    /// Send one chunk of public→agent bytes for `connection_id`.
    pub async fn write_tcp(&self, connection_id: u64, bytes: &[u8]) -> TunnelResult<()> {
        let frame = Frame::TcpData {
            connection_id,
            payload: TcpDataPayload::from_bytes(bytes),
        };
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        self.stats
            .bytes_in
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Close a sub-connection and tell the agent, exactly once. Returns
    /// `true` if the connection was still open.
    pub async fn close_tcp(&self, connection_id: u64) -> bool {
        let removed = self
            .tcp_conns
            .lock()
            .expect("tcp table poisoned")
            .remove(&connection_id)
            .is_some();
        if removed {
            let _ = self.outgoing.send(Frame::TcpClose { connection_id }).await;
        }
        removed
    }

    // ── Incoming frame handling (control reader only) ────────────────

    /// Apply one frame received from the agent.
    pub async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Response {
                request_id,
                payload,
            } => {
                let waiter = self
                    .pending
                    .lock()
                    .expect("pending table poisoned")
                    .remove(&request_id);
                match waiter {
                    Some(tx) => {
                        if tx.send(payload).is_err() {
                            debug!(request_id, "waiter gone, response discarded");
                        }
                    }
                    None => {
                        debug!(request_id, "late or unknown response discarded");
                    }
                }
            }
            Frame::TcpData {
                connection_id,
                payload,
            } => {
                let bytes = match payload.to_bytes() {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(connection_id, error = %e, "dropping undecodable tcp_data");
                        return;
                    }
                };
                self.stats
                    .bytes_out
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                let tx = self
                    .tcp_conns
                    .lock()
                    .expect("tcp table poisoned")
                    .get(&connection_id)
                    .cloned();
                match tx {
                    // Blocking on a full queue backpressures the control
                    // reader, which is the bound the data path relies on.
                    Some(tx) => {
                        if tx.send(bytes).await.is_err() {
                            debug!(connection_id, "public side gone, tcp_data dropped");
                        }
                    }
                    None => debug!(connection_id, "tcp_data for unknown connection"),
                }
            }
            Frame::TcpClose { connection_id } => {
                // Dropping the sender ends the public writer's receive loop.
                self.tcp_conns
                    .lock()
                    .expect("tcp table poisoned")
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
                    "agent reported tcp error"
                );
                self.tcp_conns
                    .lock()
                    .expect("tcp table poisoned")
                    .remove(&connection_id);
            }
            Frame::Ping => {
                let _ = self.outgoing.send(Frame::Pong).await;
            }
            Frame::Register { .. } => {
                warn!(tunnel = %self.tunnel_id, "register on an active session ignored");
            }
            other => {
                debug!(
                    tunnel = %self.tunnel_id,
                    frame = other.frame_type(),
                    "ignoring unexpected frame"
                );
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Close the session: resolve every outstanding waiter with
    /// session-closed and drop all sub-connection queues. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the oneshot senders resolves each dispatch_http with
        // SessionClosed; dropping the mpsc senders ends each public writer.
        self.pending.lock().expect("pending table poisoned").clear();
        self.tcp_conns.lock().expect("tcp table poisoned").clear();
        debug!(tunnel = %self.tunnel_id, subdomain = %self.subdomain, "session closed");
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    #[cfg(test)]
    fn tcp_conns_len(&self) -> usize {
        self.tcp_conns.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn http_session(outgoing: mpsc::Sender<Frame>) -> Arc<TunnelSession> {
        Arc::new(TunnelSession::new(
            "t-1".into(),
            "demo".into(),
            Protocol::Http,
            None,
            None,
            Vec::new(),
            outgoing,
        ))
    }

    fn tcp_session(outgoing: mpsc::Sender<Frame>) -> Arc<TunnelSession> {
        Arc::new(TunnelSession::new(
            "t-2".into(),
            "echo".into(),
            Protocol::Tcp,
            Some(10500),
            None,
            Vec::new(),
            outgoing,
        ))
    }

    fn simple_request() -> RequestPayload {
        RequestPayload {
            method: "GET".into(),
            path: "/hello".into(),
            headers: BTreeMap::new(),
            body: None,
            encoding: None,
        }
    }

    fn ok_response() -> ResponsePayload {
        ResponsePayload {
            status_code: 200,
            headers: BTreeMap::new(),
            body: Some("{\"ok\":true}".into()),
            encoding: None,
        }
    }

    #[tokio::test]
    async fn dispatch_resolves_with_matching_response() {
        let (tx, mut rx) = mpsc::channel(8);
        let session = http_session(tx);

        let dispatcher = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .dispatch_http(simple_request(), Duration::from_secs(5))
                    .await
            })
        };

        let request_id = match rx.recv().await.unwrap() {
            Frame::Request { request_id, .. } => request_id,
            other => panic!("expected request frame, got {other:?}"),
        };
        session
            .handle_frame(Frame::Response {
                request_id,
                payload: ok_response(),
            })
            .await;

        let response = dispatcher.await.unwrap().unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(session.pending_len(), 0);
        assert_eq!(session.stats().requests, 1);
    }

    #[tokio::test]
    async fn dispatch_times_out_and_late_response_is_discarded() {
        let (tx, mut rx) = mpsc::channel(8);
        let session = http_session(tx);

        let err = session
            .dispatch_http(simple_request(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Timeout));
        assert_eq!(session.pending_len(), 0);

        let request_id = match rx.recv().await.unwrap() {
            Frame::Request { request_id, .. } => request_id,
            other => panic!("expected request frame, got {other:?}"),
        };
        // Late response for the expired id must be a quiet no-op.
        session
            .handle_frame(Frame::Response {
                request_id,
                payload: ok_response(),
            })
            .await;
        assert_eq!(session.pending_len(), 0);
    }

    #[tokio::test]
    async fn close_rejects_outstanding_and_future_dispatches() {
        let (tx, mut rx) = mpsc::channel(8);
        let session = http_session(tx);

        let dispatcher = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .dispatch_http(simple_request(), Duration::from_secs(5))
                    .await
            })
        };
        // Wait for the request to be in flight before closing.
        let _ = rx.recv().await.unwrap();
        session.close();

        let err = dispatcher.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::SessionClosed));

        let err = session
            .dispatch_http(simple_request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::SessionClosed));

        // Idempotent.
        session.close();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn tcp_connect_data_and_single_close() {
        let (tx, mut frames) = mpsc::channel(8);
        let session = tcp_session(tx);
        let remote: SocketAddr = "192.0.2.9:55000".parse().unwrap();

        let (connection_id, mut from_agent) =
            session.open_tcp_connection(remote).await.unwrap();
        match frames.recv().await.unwrap() {
            Frame::TcpConnect {
                connection_id: cid,
                payload,
            } => {
                assert_eq!(cid, connection_id);
                assert_eq!(payload.remote_address, "192.0.2.9");
                assert_eq!(payload.local_port, 10500);
            }
            other => panic!("expected tcp_connect, got {other:?}"),
        }

        session.write_tcp(connection_id, b"hello\n").await.unwrap();
        match frames.recv().await.unwrap() {
            Frame::TcpData { payload, .. } => {
                assert_eq!(payload.to_bytes().unwrap(), b"hello\n")
            }
            other => panic!("expected tcp_data, got {other:?}"),
        }

        session
            .handle_frame(Frame::TcpData {
                connection_id,
                payload: TcpDataPayload::from_bytes(b"hello\n"),
            })
            .await;
        assert_eq!(from_agent.recv().await.unwrap(), b"hello\n");

        assert!(session.close_tcp(connection_id).await);
        match frames.recv().await.unwrap() {
            Frame::TcpClose {
                connection_id: cid,
            } => assert_eq!(cid, connection_id),
            other => panic!("expected tcp_close, got {other:?}"),
        }
        // Second close is a no-op with no extra frame.
        assert!(!session.close_tcp(connection_id).await);
        assert_eq!(session.tcp_conns_len(), 0);
    }

    #[tokio::test]
    async fn agent_tcp_close_tears_down_queue() {
        let (tx, mut frames) = mpsc::channel(8);
        let session = tcp_session(tx);
        let remote: SocketAddr = "192.0.2.9:55001".parse().unwrap();

        let (connection_id, mut from_agent) =
            session.open_tcp_connection(remote).await.unwrap();
        let _ = frames.recv().await;

        session.handle_frame(Frame::TcpClose { connection_id }).await;
        assert!(from_agent.recv().await.is_none());
        assert_eq!(session.tcp_conns_len(), 0);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (tx, mut frames) = mpsc::channel(8);
        let session = http_session(tx);
        session.handle_frame(Frame::Ping).await;
        assert!(matches!(frames.recv().await.unwrap(), Frame::Pong));
    }

    #[test]
    fn empty_allow_list_admits_any_ip() {
        let (tx, _rx) = mpsc::channel(1);
        let session = http_session(tx);
        assert!(session.ip_allowed("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn cidr_allow_list_filters() {
        let (tx, _rx) = mpsc::channel(1);
        let session = TunnelSession::new(
            "t-3".into(),
            "gated".into(),
            Protocol::Http,
            None,
            None,
            vec!["192.168.1.0/24".parse().unwrap()],
            tx,
        );
        assert!(session.ip_allowed("192.168.1.50".parse().unwrap()));
        assert!(!session.ip_allowed("192.168.2.1".parse().unwrap()));
    }
}
