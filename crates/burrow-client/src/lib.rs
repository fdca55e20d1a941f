//! burrow-client: the tunnel agent.
//!
//! Maintains the outbound control channel to a burrow broker, forwards
//! inbound `request` frames to the local HTTP service and `tcp_*` frames to
//! the local TCP service, and reconnects with exponential backoff when the
//! channel drops.

pub mod agent;
pub mod backoff;
pub mod config;
pub mod events;
pub mod local;
pub mod tls;

pub use agent::{Agent, AgentCloser, AgentOutcome};
pub use config::{AgentConfig, ReconnectConfig};
pub use events::{AgentEvent, TunnelInfo};
