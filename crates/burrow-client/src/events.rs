//! Observable agent events, consumed by the CLI (or any embedder) over an
//! mpsc channel.

use burrow_core::frames::Protocol;
use std::time::Duration;

/// What the broker assigned to this tunnel.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub subdomain: String,
    pub public_url: String,
    pub protocol: Protocol,
    pub tcp_port: Option<u16>,
}

/// Lifecycle and traffic events emitted by the agent.
///
/// After a reconnect the broker may have assigned a different subdomain;
/// consumers must read the fresh [`TunnelInfo`] carried by `Reconnected`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Connected(TunnelInfo),
    Disconnected,
    Reconnecting {
        attempt: u32,
        max: u32,
        delay: Duration,
    },
    Reconnected(TunnelInfo),
    ReconnectFailed {
        attempts: u32,
    },
    Request {
        method: String,
        path: String,
        status: u16,
    },
    TcpOpened {
        connection_id: u64,
    },
    TcpClosed {
        connection_id: u64,
    },
}
