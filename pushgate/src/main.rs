mod server;
mod ws;

use anyhow::Result;
use clap::Parser;
use pushgate_cluster::{NodeConfig, PushService, RegistryLimits};
use pushgate_core::{logging, Config};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "pushgate", about = "Clustered WebSocket push gateway")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "PUSHGATE_CONFIG")]
    config: Option<String>,
}

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    use std::net::UdpSocket;

    // Try to get hostname, fallback to "unknown"
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    // Get local IP address if available
    let local_ip = UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map_or_else(|_| "0.0.0.0".to_string(), |addr| addr.ip().to_string());

    // Add random suffix for uniqueness
    let suffix = nanoid::nanoid!(6);

    format!("{hostname}_{local_ip}-{suffix}")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Pushgate server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Initialize the push service
    let node_id = config
        .cluster
        .node_id
        .clone()
        .unwrap_or_else(generate_node_id);
    info!("Node ID: {node_id}");

    let node_config = NodeConfig {
        redis_url: config.redis.url.clone(),
        node_id,
        channel: config.cluster.channel.clone(),
        ..NodeConfig::default()
    };
    let service = Arc::new(PushService::new(node_config, RegistryLimits::default())?);

    // 5. Serve HTTP + WebSocket
    let app = server::create_router(service.clone());
    let http_addr: std::net::SocketAddr = config
        .http_address()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid HTTP address: {e}"))?;

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {http_addr}");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    service.shutdown();

    if let Err(e) = serve_result {
        error!("HTTP server error: {e}");
        return Err(e.into());
    }

    info!("Pushgate server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install ctrl-c handler: {e}");
    } else {
        info!("Shutdown signal received");
    }
}
