mod balancer;
mod config;
mod dns;
mod reload;
mod selector;
mod upstream;
mod weights;
mod web;

use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{info, error, warn};

use crate::config::Config;
use crate::dns::engine::QueryEngine;
use crate::web::server::WebServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "neko_wrr=info".into()),
        )
        .init();

    info!("🐱 neko-wrr v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "neko-wrr.toml".to_string());

    let config = Config::load(&config_path)?;
    info!("Config loaded from {}", config_path);

    let config = Arc::new(config);
    let engine = Arc::new(QueryEngine::new(&config)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Startup load and weight reload loop
    if let Some(balancer) = engine.balancer.clone() {
        balancer
            .initial_load()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load weight file: {}", e))?;

        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            balancer.run_reload_loop(shutdown).await;
        });
    }

    // Start Web UI
    let web_engine = engine.clone();
    let web_config = config.clone();
    let web_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let web = WebServer::new(web_engine, web_config);
        if let Err(e) = web.run(web_shutdown).await {
            error!("Web server error: {}", e);
        }
    });

    // Bind UDP socket
    let bind_addr = format!("{}:{}", config.listen.address, config.listen.port);
    let udp_socket = Arc::new(UdpSocket::bind(&bind_addr).await?);
    info!("🐱 neko-wrr listening on {} (UDP)", bind_addr);

    // Bind TCP listener
    let tcp_listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("🐱 neko-wrr listening on {} (TCP)", bind_addr);

    // TCP handler
    let tcp_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let eng = tcp_engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = eng.handle_tcp(stream, addr).await {
                            warn!("TCP handler error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("TCP accept error: {}", e),
            }
        }
    });

    // Main UDP loop
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("🐱 Shutting down...");
                let _ = shutdown_tx.send(true);
                break;
            }
            received = udp_socket.recv_from(&mut buf) => match received {
                Ok((len, addr)) => {
                    let packet = buf[..len].to_vec();
                    let socket = udp_socket.clone();
                    let eng = engine.clone();
                    tokio::spawn(async move {
                        match eng.handle_query(&packet).await {
                            Ok(response) => {
                                if let Err(e) = socket.send_to(&response, addr).await {
                                    warn!("Failed to send response to {}: {}", addr, e);
                                }
                            }
                            Err(e) => {
                                warn!("Query handling error from {}: {}", addr, e);
                                // Send SERVFAIL
                                if let Ok(servfail) = dns::packet::build_servfail(&packet) {
                                    let _ = socket.send_to(&servfail, addr).await;
                                }
                            }
                        }
                    });
                }
                Err(e) => error!("UDP recv error: {}", e),
            }
        }
    }

    Ok(())
}
