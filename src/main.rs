//! The `mhub` broker binary: loads a JSON configuration, builds a [`Hub`],
//! and serves every configured listener until the process is interrupted.

use std::net::SocketAddr;

use mhub_core::{init_observability, shutdown_observability, ObservabilityConfig};
use mhub_server::{serve_tcp, serve_websocket, Config, ListenSpec};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "mhub.json".to_string());
    let config_text = std::fs::read_to_string(&config_path).unwrap_or_else(|_| {
        eprintln!("no config file at {config_path}, starting with defaults");
        "{}".to_string()
    });
    let config = Config::from_json(&config_text)?;

    let otel_config = ObservabilityConfig::new("mhub").with_log_level(
        config.log_level.clone().unwrap_or_else(|| "info".to_string()),
    );
    init_observability(otel_config).expect("failed to initialize observability");

    let listen = config.listen.clone();
    let hub = config.build_hub().await?;

    let mut listeners = Vec::with_capacity(listen.len());
    for spec in listen {
        match spec {
            ListenSpec::WebSocket { host, port, .. } => {
                let addr = SocketAddr::new(host, port);
                let listener = TcpListener::bind(addr).await?;
                tracing::info!(%addr, "listening for websocket connections");
                listeners.push(tokio::spawn(serve_websocket(listener, hub.clone())));
            }
            ListenSpec::Tcp { host, port, .. } => {
                let addr = SocketAddr::new(host, port);
                let listener = TcpListener::bind(addr).await?;
                tracing::info!(%addr, "listening for tcp connections");
                listeners.push(tokio::spawn(serve_tcp(listener, hub.clone())));
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    for listener in listeners {
        listener.abort();
    }
    shutdown_observability();
    Ok(())
}
