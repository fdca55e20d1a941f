//! External boundary adapters: the registration Authorizer and the
//! request-log sink.
//!
//! Both are enum-dispatched (no trait objects) so the wiring stays explicit;
//! each variant is one integration.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// What the authorizer decided about a REGISTER.
#[derive(Debug)]
pub enum AuthVerdict {
    /// Proceed, optionally attaching a per-tunnel IP allow list.
    Accept { ip_allow_list: Vec<IpNet> },
    /// Refuse the registration; the reason goes back in the `error` frame.
    Reject { reason: String },
    /// The desired subdomain may not be used; the broker assigns a random
    /// one instead.
    Reassign,
}

/// Registration context handed to the authorizer.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest<'a> {
    pub subdomain: &'a str,
    pub protocol: &'a str,
    pub has_password: bool,
    pub remote_addr: &'a str,
}

/// Wire shape of an external authorizer's reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthReply {
    action: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    ip_allow_list: Vec<String>,
}

/// Registration authorizer.
pub enum Authorizer {
    /// Accept everything (no external endpoint configured).
    AllowAll,
    /// Consult an HTTP endpoint with a JSON POST per registration.
    Http {
        client: reqwest::Client,
        endpoint: String,
    },
}

impl Authorizer {
    pub fn from_config(endpoint: Option<&str>) -> Self {
        match endpoint {
            Some(url) => Authorizer::Http {
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(5))
                    .build()
                    .unwrap_or_default(),
                endpoint: url.to_string(),
            },
            None => Authorizer::AllowAll,
        }
    }

    /// Decide whether this registration may proceed.
    ///
    /// An unreachable or malformed external authorizer fails closed: the
    /// registration is rejected rather than silently admitted.
    pub async fn authorize(&self, request: &AuthRequest<'_>) -> AuthVerdict {
        match self {
            Authorizer::AllowAll => AuthVerdict::Accept {
                ip_allow_list: Vec::new(),
            },
            Authorizer::Http { client, endpoint } => {
                let reply = async {
                    client
                        .post(endpoint)
                        .json(request)
                        .send()
                        .await?
                        .error_for_status()?
                        .json::<AuthReply>()
                        .await
                }
                .await;

                match reply {
                    Ok(reply) => match reply.action.as_str() {
                        "accept" => AuthVerdict::Accept {
                            ip_allow_list: parse_allow_list(&reply.ip_allow_list),
                        },
                        "reassign" => AuthVerdict::Reassign,
                        "reject" => AuthVerdict::Reject {
                            reason: reply
                                .reason
                                .unwrap_or_else(|| "registration rejected".to_string()),
                        },
                        other => {
                            warn!(action = %other, "authorizer returned unknown action");
                            AuthVerdict::Reject {
                                reason: "registration rejected".to_string(),
                            }
                        }
                    },
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "authorizer unreachable");
                        AuthVerdict::Reject {
                            reason: "authorizer unavailable".to_string(),
                        }
                    }
                }
            }
        }
    }
}

/// Parse allow-list entries; bare addresses become host-length networks,
/// unparseable entries are skipped with a warning.
pub fn parse_allow_list(entries: &[String]) -> Vec<IpNet> {
    entries
        .iter()
        .filter_map(|entry| {
            if let Ok(net) = entry.parse::<IpNet>() {
                return Some(net);
            }
            if let Ok(addr) = entry.parse::<IpAddr>() {
                return Some(IpNet::from(addr));
            }
            warn!(entry = %entry, "ignoring unparseable allow-list entry");
            None
        })
        .collect()
}

/// One observational event from the data plane.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    HttpRequest {
        subdomain: String,
        method: String,
        path: String,
        status: u16,
        bytes_in: u64,
        bytes_out: u64,
        duration_ms: u64,
        client_ip: String,
        user_agent: Option<String>,
    },
    TcpOpened {
        subdomain: String,
        connection_id: u64,
        remote_addr: String,
    },
    TcpClosed {
        subdomain: String,
        connection_id: u64,
        bytes_in: u64,
        bytes_out: u64,
    },
}

/// Fire-and-forget sink for completed-request metadata.
#[derive(Clone)]
pub enum RequestLogSink {
    /// Emit structured tracing events (the default integration).
    Tracing,
    /// Collect events in memory; used by tests and embedders.
    Memory(Arc<Mutex<Vec<TunnelEvent>>>),
}

impl RequestLogSink {
    pub fn memory() -> (Self, Arc<Mutex<Vec<TunnelEvent>>>) {
        let store = Arc::new(Mutex::new(Vec::new()));
        (RequestLogSink::Memory(store.clone()), store)
    }

    pub fn record(&self, event: TunnelEvent) {
        match self {
            RequestLogSink::Tracing => match &event {
                TunnelEvent::HttpRequest {
                    subdomain,
                    method,
                    path,
                    status,
                    bytes_in,
                    bytes_out,
                    duration_ms,
                    client_ip,
                    ..
                } => {
                    info!(
                        target: "burrow::request_log",
                        subdomain = %subdomain,
                        method = %method,
                        path = %path,
                        status = *status,
                        bytes_in = *bytes_in,
                        bytes_out = *bytes_out,
                        duration_ms = *duration_ms,
                        client_ip = %client_ip,
                        "request completed"
                    );
                }
                TunnelEvent::TcpOpened {
                    subdomain,
                    connection_id,
                    remote_addr,
                } => {
                    info!(
                        target: "burrow::request_log",
                        subdomain = %subdomain,
                        connection_id = *connection_id,
                        remote = %remote_addr,
                        "tcp connection opened"
                    );
                }
                TunnelEvent::TcpClosed {
                    subdomain,
                    connection_id,
                    bytes_in,
                    bytes_out,
                } => {
                    info!(
                        target: "burrow::request_log",
                        subdomain = %subdomain,
                        connection_id = *connection_id,
                        bytes_in = *bytes_in,
                        bytes_out = *bytes_out,
                        "tcp connection closed"
                    );
                }
            },
            RequestLogSink::Memory(store) => {
                if let Ok(mut events) = store.lock() {
                    events.push(event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_accepts_with_empty_list() {
        let authorizer = Authorizer::from_config(None);
        let verdict = authorizer
            .authorize(&AuthRequest {
                subdomain: "demo",
                protocol: "http",
                has_password: false,
                remote_addr: "203.0.113.1",
            })
            .await;
        match verdict {
            AuthVerdict::Accept { ip_allow_list } => assert!(ip_allow_list.is_empty()),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn allow_list_parses_cidrs_and_bare_addresses() {
        let nets = parse_allow_list(&[
            "192.168.1.0/24".to_string(),
            "10.0.0.1".to_string(),
            "not-an-ip".to_string(),
        ]);
        assert_eq!(nets.len(), 2);
        assert!(nets[0].contains(&"192.168.1.50".parse::<IpAddr>().unwrap()));
        assert!(nets[1].contains(&"10.0.0.1".parse::<IpAddr>().unwrap()));
        assert!(!nets[1].contains(&"10.0.0.2".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn memory_sink_records() {
        let (sink, store) = RequestLogSink::memory();
        sink.record(TunnelEvent::TcpOpened {
            subdomain: "echo".into(),
            connection_id: 1,
            remote_addr: "192.0.2.1:4000".into(),
        });
        assert_eq!(store.lock().unwrap().len(), 1);
    }
}
