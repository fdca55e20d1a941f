//! burrow-server: the tunnel broker.
//!
//! Terminates public HTTP and TCP traffic and multiplexes it over WebSocket
//! control channels to agents. One public port carries everything HTTP:
//! `GET /tunnel` on the bare base domain upgrades to an agent control
//! channel, `/healthz` reports liveness, and every other request is routed
//! to a tunnel by its Host-header subdomain.

mod allocator;
mod config;
mod control;
mod hooks;
mod ingress;
mod listener;
mod registry;
mod session;
mod state;

use axum::extract::{ConnectInfo, Request, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::BrokerConfig;
use crate::state::AppState;

/// burrow-server — tunnel broker
#[derive(Parser, Debug)]
#[command(name = "burrow-server", version, about = "Tunnel broker for burrow")]
struct Cli {
    /// Public HTTP port (ingress + control channel)
    #[arg(short, long)]
    port: Option<u16>,

    /// Base domain tunnels hang off of (overrides TUNNEL_DOMAIN)
    #[arg(short, long)]
    domain: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.burrow/server.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match BrokerConfig::load(Some(&config_path), cli.domain.as_deref(), cli.port) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %config.domain,
        port = config.port,
        tcp_range = %format!("{}-{}", config.tcp_port_min, config.tcp_port_max),
        "starting burrow-server"
    );

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config);
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind public port");
            std::process::exit(1);
        }
    };
    info!(addr = %bind_addr, "broker listening");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = serve.await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
    info!("burrow-server stopped");
}

fn build_router(state: AppState) -> Router {
    // Both named routes dispatch on Host internally: addressed through a
    // tunnel subdomain they forward like any other path, so they are
    // registered for every method.
    Router::new()
        .route("/tunnel", any(tunnel_endpoint))
        .route("/healthz", any(healthz))
        .fallback(ingress::dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `/tunnel` serves two masters: on the bare base domain it upgrades to the
/// agent control channel; addressed through a tunnel subdomain it is just
/// another path to forward.
async fn tunnel_endpoint(
    ws: Option<WebSocketUpgrade>,
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if ingress::extract_subdomain(host, &state.config.domain).is_some() {
        return ingress::dispatch(State(state), ConnectInfo(remote_addr), request).await;
    }
    match ws {
        Some(ws) => {
            control::control_handler(ws, State(state), ConnectInfo(remote_addr))
                .await
                .into_response()
        }
        None => (
            axum::http::StatusCode::UPGRADE_REQUIRED,
            "websocket upgrade required",
        )
            .into_response(),
    }
}

/// `/healthz` — liveness plus a tunnel-count snapshot, on the bare base
/// domain only; through a tunnel subdomain the path is forwarded as-is.
async fn healthz(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if ingress::extract_subdomain(host, &state.config.domain).is_some() {
        return ingress::dispatch(State(state), ConnectInfo(remote_addr), request).await;
    }

    let sessions = state.registry.sessions();
    let (requests, tcp_connections, bytes_in, bytes_out) =
        sessions.iter().fold((0, 0, 0, 0), |acc, s| {
            let stats = s.stats();
            (
                acc.0 + stats.requests,
                acc.1 + stats.tcp_connections,
                acc.2 + stats.bytes_in,
                acc.3 + stats.bytes_out,
            )
        });
    Json(serde_json::json!({
        "status": "ok",
        "activeTunnels": sessions.len(),
        "requests": requests,
        "tcpConnections": tcp_connections,
        "bytesIn": bytes_in,
        "bytesOut": bytes_out,
    }))
    .into_response()
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_client::{Agent, AgentConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve a broker on an ephemeral port with domain `tunnel.test`.
    async fn spawn_broker() -> (u16, AppState) {
        let config = BrokerConfig::load(None, Some("tunnel.test"), None).unwrap();
        let state = AppState::new(config);
        let app = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        (port, state)
    }

    /// Minimal local HTTP service answering every request with 200 JSON.
    async fn spawn_local_http() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\n\
                              content-type: application/json\r\n\
                              content-length: 11\r\n\
                              connection: close\r\n\r\n\
                              {\"ok\":true}",
                        )
                        .await;
                });
            }
        });
        port
    }

    /// One raw HTTP/1.1 request against the broker with a tunnel Host.
    async fn public_get(broker_port: u16, host: &str, path: &str) -> String {
        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", broker_port))
            .await
            .unwrap();
        let request =
            format!("GET {path} HTTP/1.1\r\nhost: {host}\r\nconnection: close\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn public_request_round_trips_through_agent() {
        let (broker_port, state) = spawn_broker().await;
        let local_port = spawn_local_http().await;

        let config = AgentConfig {
            server_url: format!("ws://127.0.0.1:{broker_port}"),
            local_host: "127.0.0.1".into(),
            local_port,
            subdomain: Some("demo".into()),
            ..Default::default()
        };
        let (mut agent, info, _events) = Agent::start(config).await.unwrap();
        assert_eq!(info.subdomain, "demo");
        assert!(state.registry.lookup("demo").is_some());

        let response = public_get(broker_port, "demo.tunnel.test", "/hello").await;
        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
        assert!(response.contains("{\"ok\":true}"));

        // Tunnel stats saw the request.
        let stats = state.registry.lookup("demo").unwrap().stats();
        assert_eq!(stats.requests, 1);

        agent.close();
        agent.wait().await;

        // Teardown frees the subdomain once the broker notices the close.
        for _ in 0..50 {
            if state.registry.lookup("demo").is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(state.registry.lookup("demo").is_none());
    }

    #[tokio::test]
    async fn agent_down_local_yields_502_body() {
        let (broker_port, _state) = spawn_broker().await;

        let config = AgentConfig {
            server_url: format!("ws://127.0.0.1:{broker_port}"),
            local_host: "127.0.0.1".into(),
            // Nothing listens here.
            local_port: 1,
            subdomain: Some("down".into()),
            local_request_timeout: std::time::Duration::from_millis(500),
            ..Default::default()
        };
        let (mut agent, _info, _events) = Agent::start(config).await.unwrap();

        let response = public_get(broker_port, "down.tunnel.test", "/").await;
        assert!(response.starts_with("HTTP/1.1 502"), "got: {response}");
        assert!(response.contains("Bad Gateway: Local server not responding"));

        agent.close();
        agent.wait().await;
    }

    #[tokio::test]
    async fn duplicate_subdomain_registration_is_rejected() {
        let (broker_port, _state) = spawn_broker().await;
        let local_port = spawn_local_http().await;

        let config = AgentConfig {
            server_url: format!("ws://127.0.0.1:{broker_port}"),
            local_host: "127.0.0.1".into(),
            local_port,
            subdomain: Some("solo".into()),
            ..Default::default()
        };
        let (mut agent, _info, _events) = Agent::start(config.clone()).await.unwrap();

        let err = Agent::start(config).await.unwrap_err();
        assert!(matches!(
            err,
            burrow_core::TunnelError::SubdomainTaken(_)
        ));

        agent.close();
        agent.wait().await;
    }
}
