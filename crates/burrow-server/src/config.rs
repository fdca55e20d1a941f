//! Broker configuration: TOML file + CLI overrides.

use burrow_core::{TunnelError, TunnelResult, RESERVED_SUBDOMAINS};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub tcp: TcpSection,
}

/// `[broker]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    /// Base domain tunnels hang off of, e.g. `tunnel.example.com`.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Public HTTP port (ingress + control-channel upgrade).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Extra reserved subdomains, merged with the built-in set.
    #[serde(default)]
    pub reserved_subdomains: Vec<String>,
    /// Optional external authorizer endpoint consulted at REGISTER.
    #[serde(default)]
    pub authorizer_url: Option<String>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            port: default_port(),
            reserved_subdomains: Vec::new(),
            authorizer_url: None,
        }
    }
}

/// `[http]` section: ingress limits and timing.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSection {
    /// Maximum forwarded request body, in bytes.
    #[serde(default = "default_body_cap")]
    pub body_cap_bytes: usize,
    /// Per-request dispatch deadline, in seconds.
    #[serde(default = "default_request_deadline")]
    pub request_deadline_secs: u64,
    /// Expected agent heartbeat interval, in seconds. Read silence beyond
    /// three intervals closes the session.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// How long a REGISTER handshake may take before the channel is dropped.
    #[serde(default = "default_register_timeout")]
    pub register_timeout_secs: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            body_cap_bytes: default_body_cap(),
            request_deadline_secs: default_request_deadline(),
            ping_interval_secs: default_ping_interval(),
            register_timeout_secs: default_register_timeout(),
        }
    }
}

/// `[tcp]` section: allocatable public port range.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpSection {
    #[serde(default = "default_tcp_port_min")]
    pub port_min: u16,
    #[serde(default = "default_tcp_port_max")]
    pub port_max: u16,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            port_min: default_tcp_port_min(),
            port_max: default_tcp_port_max(),
        }
    }
}

fn default_domain() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_body_cap() -> usize {
    1024 * 1024
}
fn default_request_deadline() -> u64 {
    30
}
fn default_ping_interval() -> u64 {
    30
}
fn default_register_timeout() -> u64 {
    10
}
fn default_tcp_port_min() -> u16 {
    10000
}
fn default_tcp_port_max() -> u16 {
    65535
}

/// Resolved broker configuration (file + env + CLI overrides applied).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub domain: String,
    pub port: u16,
    pub body_cap_bytes: usize,
    pub request_deadline: Duration,
    /// Read-silence tolerance on a control channel (3× ping interval).
    pub idle_timeout: Duration,
    pub register_timeout: Duration,
    pub tcp_port_min: u16,
    pub tcp_port_max: u16,
    pub reserved_subdomains: HashSet<String>,
    pub authorizer_url: Option<String>,
}

impl BrokerConfig {
    /// Load configuration from a TOML file, then apply env + CLI overrides.
    ///
    /// Precedence (highest first): CLI flags, the `TUNNEL_DOMAIN`
    /// environment variable, the config file, built-in defaults. A missing
    /// config file is not an error.
    pub fn load(
        config_path: Option<&Path>,
        cli_domain: Option<&str>,
        cli_port: Option<u16>,
    ) -> TunnelResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TunnelError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let env_domain = std::env::var("TUNNEL_DOMAIN").ok();
        let domain = cli_domain
            .map(str::to_string)
            .or(env_domain)
            .unwrap_or(file_config.broker.domain);
        let port = cli_port.unwrap_or(file_config.broker.port);

        let tcp = &file_config.tcp;
        if tcp.port_min > tcp.port_max {
            return Err(TunnelError::Config(format!(
                "tcp port range {}-{} is inverted",
                tcp.port_min, tcp.port_max
            )));
        }

        let mut reserved: HashSet<String> = RESERVED_SUBDOMAINS
            .iter()
            .map(|s| s.to_string())
            .collect();
        reserved.extend(
            file_config
                .broker
                .reserved_subdomains
                .iter()
                .map(|s| s.to_ascii_lowercase()),
        );

        let http = &file_config.http;
        Ok(Self {
            domain,
            port,
            body_cap_bytes: http.body_cap_bytes,
            request_deadline: Duration::from_secs(http.request_deadline_secs),
            idle_timeout: Duration::from_secs(http.ping_interval_secs * 3),
            register_timeout: Duration::from_secs(http.register_timeout_secs),
            tcp_port_min: tcp.port_min,
            tcp_port_max: tcp.port_max,
            reserved_subdomains: reserved,
            authorizer_url: file_config.broker.authorizer_url,
        })
    }

    /// Public URL for an HTTP tunnel on `subdomain`.
    pub fn http_public_url(&self, subdomain: &str) -> String {
        if self.port == 80 {
            format!("https://{subdomain}.{}", self.domain)
        } else {
            format!("https://{subdomain}.{}:{}", self.domain, self.port)
        }
    }

    /// Public URL for a TCP tunnel on `tcp_port`.
    pub fn tcp_public_url(&self, tcp_port: u16) -> String {
        format!("tcp://{}:{tcp_port}", self.domain)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}
