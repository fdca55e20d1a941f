//! Agent configuration.

use burrow_core::frames::Protocol;
use burrow_core::{TunnelError, TunnelResult};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Reconnection policy knobs.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(60_000),
            jitter_factor: 0.30,
            max_attempts: 10,
        }
    }
}

/// Configuration for one tunnel agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker base URL, e.g. `https://tunnel.example.com` or
    /// `ws://localhost:8080`.
    pub server_url: String,
    pub local_host: String,
    pub local_port: u16,
    pub subdomain: Option<String>,
    pub password: Option<String>,
    pub protocol: Protocol,
    /// Skip TLS certificate verification on the control dial.
    pub insecure: bool,
    /// Custom CA bundle (PEM) for the control dial.
    pub ca_path: Option<PathBuf>,
    pub ping_interval: Duration,
    pub register_timeout: Duration,
    pub local_request_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".to_string(),
            local_host: "localhost".to_string(),
            local_port: 3000,
            subdomain: None,
            password: None,
            protocol: Protocol::Http,
            insecure: false,
            ca_path: None,
            ping_interval: Duration::from_secs(30),
            register_timeout: Duration::from_secs(10),
            local_request_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl AgentConfig {
    /// The control-channel URL: `ws[s]://<host>[:port]/tunnel`, with the
    /// scheme derived from the configured server URL.
    pub fn control_url(&self) -> TunnelResult<String> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| TunnelError::Config(format!("invalid server url: {e}")))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TunnelError::Config(format!(
                    "unsupported server url scheme: {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| TunnelError::Config("invalid server url scheme".into()))?;
        url.set_path("/tunnel");
        url.set_query(None);
        Ok(url.to_string())
    }
}
