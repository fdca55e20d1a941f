//! burrow — expose a local service through a burrow broker.
//!
//! Maintains the tunnel until interrupted. Exit code 0 on a clean close,
//! 1 on unrecoverable connection failure or invalid configuration.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::debug;

use burrow_client::{Agent, AgentConfig, AgentEvent, AgentOutcome};
use burrow_core::frames::Protocol;

/// burrow — tunnel agent
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about = "Expose a local service through a burrow broker")]
struct Cli {
    /// Local port to expose
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Local host the service listens on
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Desired subdomain (random if omitted)
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Password-protect the tunnel; with no value, prompts interactively
    /// (or reads LT_PASSWORD)
    #[arg(long, num_args = 0..=1, default_missing_value = "", value_name = "PASSWORD")]
    password: Option<String>,

    /// Tunnel a raw TCP service instead of HTTP
    #[arg(long)]
    tcp: bool,

    /// Broker base URL
    #[arg(long, default_value = "ws://localhost:8080")]
    server: String,

    /// Disable TLS certificate verification (dangerous)
    #[arg(long)]
    insecure: bool,

    /// Custom CA bundle (PEM) for the broker connection
    #[arg(long, value_name = "PATH")]
    ca: Option<PathBuf>,

    /// Log filter (RUST_LOG syntax)
    #[arg(long, default_value = "warn")]
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

    match run(cli).await {
        Ok(AgentOutcome::Closed) => {}
        Ok(AgentOutcome::ReconnectFailed) => {
            eprintln!("burrow: connection lost and reconnection exhausted");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("burrow: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<AgentOutcome> {
    if cli.insecure {
        eprintln!("warning: TLS certificate verification is disabled (--insecure)");
    }

    let password = resolve_password(cli.password)?;
    let local_target = format!("{}:{}", cli.host, cli.port);
    let config = AgentConfig {
        server_url: cli.server,
        local_host: cli.host,
        local_port: cli.port,
        subdomain: cli.subdomain,
        password,
        protocol: if cli.tcp { Protocol::Tcp } else { Protocol::Http },
        insecure: cli.insecure,
        ca_path: cli.ca,
        ..Default::default()
    };

    let (mut agent, info, mut events) = Agent::start(config)
        .await
        .context("failed to establish tunnel")?;
    println!("tunnel ready: {} -> {local_target}", info.public_url);

    // Event printer runs until the agent's channel closes.
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    // Ctrl+C closes the tunnel; the run loop then winds down cleanly.
    let closer = agent.closer();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received, closing tunnel");
            closer.close();
        }
    });

    let outcome = agent.wait().await;
    printer.abort();
    Ok(outcome)
}

/// Resolve the tunnel password from flag value, `LT_PASSWORD`, or an
/// interactive prompt (bare `--password`).
fn resolve_password(flag: Option<String>) -> Result<Option<String>> {
    let env_password = std::env::var("LT_PASSWORD").ok().filter(|p| !p.is_empty());
    match flag {
        Some(value) if !value.is_empty() => Ok(Some(value)),
        Some(_) => {
            if let Some(password) = env_password {
                return Ok(Some(password));
            }
            let password = dialoguer::Password::new()
                .with_prompt("Tunnel password")
                .interact()
                .context("failed to read password")?;
            Ok(Some(password))
        }
        None => Ok(env_password),
    }
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::Connected(info) => {
            println!("connected: {} (subdomain {})", info.public_url, info.subdomain);
        }
        AgentEvent::Disconnected => println!("disconnected from broker"),
        AgentEvent::Reconnecting {
            attempt,
            max,
            delay,
        } => {
            println!(
                "reconnecting (attempt {attempt}/{max}) in {:.1}s",
                delay.as_secs_f64()
            );
        }
        AgentEvent::Reconnected(info) => {
            println!(
                "reconnected: {} (subdomain {})",
                info.public_url, info.subdomain
            );
        }
        AgentEvent::ReconnectFailed { attempts } => {
            println!("giving up after {attempts} reconnect attempts");
        }
        AgentEvent::Request {
            method,
            path,
            status,
        } => {
            println!("{method} {path} -> {status}");
        }
        AgentEvent::TcpOpened { connection_id } => {
            debug!(connection_id, "tcp connection opened");
        }
        AgentEvent::TcpClosed { connection_id } => {
            debug!(connection_id, "tcp connection closed");
        }
    }
}
