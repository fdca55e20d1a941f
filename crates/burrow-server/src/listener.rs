//! Public TCP listener management for TCP-mode tunnels.
//!
//! On REGISTER the manager allocates a port from the configured range, binds
//! a listener, and runs one accept loop per tunnel. Every accepted socket
//! becomes a multiplexed sub-connection on the tunnel's control channel,
//! shuttled in bounded 64 KiB chunks.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use burrow_core::{TunnelError, TunnelResult};

use crate::hooks::{RequestLogSink, TunnelEvent};
use crate::session::TunnelSession;

/// Read-chunk bound on the public→agent path.
const CHUNK_SIZE: usize = 64 * 1024;

/// How many times to retry a bind when racing the OS for a port.
const BIND_ATTEMPTS: usize = 4;

/// Allocates public ports and tracks which are in use.
pub struct TcpListenerManager {
    port_min: u16,
    port_max: u16,
    used: Mutex<HashSet<u16>>,
}

/// Handle for one tunnel's accept loop; signalling it tears the listener
/// down and releases the port.
pub struct ListenerHandle {
    cancel_tx: mpsc::Sender<()>,
    pub port: u16,
}

impl ListenerHandle {
    /// Stop the accept loop. The port returns to the free pool once the
    /// loop has drained and dropped its listener.
    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(()).await;
    }
}

impl TcpListenerManager {
    pub fn new(port_min: u16, port_max: u16) -> Self {
        Self {
            port_min,
            port_max,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate an unused port and bind its listener.
    ///
    /// The port enters the used set before the bind so concurrent
    /// registrations cannot draw it; a failed bind returns it and retries.
    pub async fn bind(&self) -> TunnelResult<(u16, TcpListener)> {
        for _ in 0..BIND_ATTEMPTS {
            let port = {
                let mut used = self.used.lock().expect("port set poisoned");
                let port = crate::allocator::random_port(self.port_min, self.port_max, &used)?;
                used.insert(port);
                port
            };

            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => return Ok((port, listener)),
                Err(e) => {
                    warn!(port, error = %e, "bind failed, retrying on another port");
                    self.release(port);
                }
            }
        }
        Err(TunnelError::PortExhausted(self.port_min, self.port_max))
    }

    /// Return a port to the free pool.
    pub fn release(&self, port: u16) {
        self.used.lock().expect("port set poisoned").remove(&port);
    }

    /// Spawn the accept loop for one TCP tunnel. Returns the handle used to
    /// stop it on session teardown.
    pub fn spawn_accept_loop(
        self: &Arc<Self>,
        listener: TcpListener,
        port: u16,
        session: Arc<TunnelSession>,
        sink: RequestLogSink,
    ) -> ListenerHandle {
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        let manager = self.clone();

        tokio::spawn(async move {
            info!(port, subdomain = %session.subdomain(), "tcp listener started");
            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => {
                        debug!(port, "accept loop cancelled");
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let session = session.clone();
                                let sink = sink.clone();
                                tokio::spawn(async move {
                                    relay_public_socket(stream, peer_addr, session, sink).await;
                                });
                            }
                            Err(e) => {
                                warn!(port, error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
            // The listener must be gone before the port is reusable.
            drop(listener);
            manager.release(port);
            info!(port, "tcp listener closed, port released");
        });

        ListenerHandle { cancel_tx, port }
    }
}

/// Shuttle one public socket through the tunnel session until either side
/// closes. Exactly one `tcp_close` is propagated regardless of who goes
/// first.
async fn relay_public_socket(
    stream: TcpStream,
    peer_addr: SocketAddr,
    session: Arc<TunnelSession>,
    sink: RequestLogSink,
) {
    let (connection_id, mut from_agent) = match session.open_tcp_connection(peer_addr).await {
        Ok(opened) => opened,
        Err(e) => {
            debug!(peer = %peer_addr, error = %e, "rejecting socket, session unavailable");
            return;
        }
    };
    sink.record(TunnelEvent::TcpOpened {
        subdomain: session.subdomain().to_string(),
        connection_id,
        remote_addr: peer_addr.to_string(),
    });

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bytes_in: u64 = 0;
    let mut bytes_out: u64 = 0;

    loop {
        tokio::select! {
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!(connection_id, "public peer closed");
                        break;
                    }
                    Ok(n) => {
                        if session.write_tcp(connection_id, &buf[..n]).await.is_err() {
                            break;
                        }
                        bytes_in += n as u64;
                    }
                    Err(e) => {
                        debug!(connection_id, error = %e, "public read error");
                        break;
                    }
                }
            }
            chunk = from_agent.recv() => {
                match chunk {
                    Some(data) => {
                        let len = data.len() as u64;
                        if write_half.write_all(&data).await.is_err() {
                            break;
                        }
                        bytes_out += len;
                    }
                    // Agent sent tcp_close / tcp_error, or the session died.
                    None => {
                        debug!(connection_id, "agent side closed");
                        break;
                    }
                }
            }
        }
    }

    let _ = write_half.shutdown().await;
    session.close_tcp(connection_id).await;
    sink.record(TunnelEvent::TcpClosed {
        subdomain: session.subdomain().to_string(),
        connection_id,
        bytes_in,
        bytes_out,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::frames::{Frame, Protocol, TcpDataPayload};
    use std::time::Duration;

    fn manager() -> Arc<TcpListenerManager> {
        Arc::new(TcpListenerManager::new(20000, 29999))
    }

    fn tcp_session(port: u16, outgoing: mpsc::Sender<Frame>) -> Arc<TunnelSession> {
        Arc::new(TunnelSession::new(
            "t-tcp".into(),
            "echo".into(),
            Protocol::Tcp,
            Some(port),
            None,
            Vec::new(),
            outgoing,
        ))
    }

    #[tokio::test]
    async fn bind_allocates_in_range_and_release_frees() {
        let manager = manager();
        let (port, listener) = manager.bind().await.unwrap();
        assert!((20000..=29999).contains(&port));
        assert!(manager.used.lock().unwrap().contains(&port));

        drop(listener);
        manager.release(port);
        assert!(!manager.used.lock().unwrap().contains(&port));
    }

    #[tokio::test]
    async fn public_socket_round_trip() {
        let manager = manager();
        let (port, listener) = manager.bind().await.unwrap();
        let (tx, mut frames) = mpsc::channel(32);
        let session = tcp_session(port, tx);
        let (sink, events) = RequestLogSink::memory();
        let handle = manager.spawn_accept_loop(listener, port, session.clone(), sink);

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let connection_id = match frames.recv().await.unwrap() {
            Frame::TcpConnect { connection_id, .. } => connection_id,
            other => panic!("expected tcp_connect, got {other:?}"),
        };

        // public → agent
        client.write_all(b"hello\n").await.unwrap();
        match frames.recv().await.unwrap() {
            Frame::TcpData { payload, .. } => {
                assert_eq!(payload.to_bytes().unwrap(), b"hello\n")
            }
            other => panic!("expected tcp_data, got {other:?}"),
        }

        // agent → public
        session
            .handle_frame(Frame::TcpData {
                connection_id,
                payload: TcpDataPayload::from_bytes(b"hello\n"),
            })
            .await;
        let mut echo = [0u8; 6];
        client.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello\n");

        // Closing the public socket propagates exactly one tcp_close.
        drop(client);
        match frames.recv().await.unwrap() {
            Frame::TcpClose {
                connection_id: cid,
            } => assert_eq!(cid, connection_id),
            other => panic!("expected tcp_close, got {other:?}"),
        }

        // Opened + closed events were recorded.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = events.lock().unwrap();
        assert!(matches!(events[0], TunnelEvent::TcpOpened { .. }));
        assert!(matches!(
            events.last().unwrap(),
            TunnelEvent::TcpClosed { .. }
        ));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_port() {
        let manager = manager();
        let (port, listener) = manager.bind().await.unwrap();
        let (tx, _frames) = mpsc::channel(8);
        let session = tcp_session(port, tx);
        let handle =
            manager.spawn_accept_loop(listener, port, session, RequestLogSink::Tracing);

        handle.shutdown().await;
        // Give the loop a beat to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.used.lock().unwrap().contains(&port));
    }
}
