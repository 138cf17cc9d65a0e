//! trellisd - Trellis mesh node
//!
//! Discovers peers over UDP, establishes encrypted sessions with them and
//! routes IPv6 packets between their mesh addresses.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trellis_net::UdpTransport;
use trellisd::config::{Config, NodeState};
use trellisd::node::Node;
use trellisd::runtime::spawn_node;
use trellisd::tun::channel_device;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    let default_level = if config.verbose { "trellisd=debug,trellis_net=debug" } else { "trellisd=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("trellisd v{} - Trellis Mesh Node", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let state = NodeState::load_or_create(&config.identity_file)?;
    let node = Node::new(state.keypair(), config.node_config())?;
    info!("Node {} has address {}", node.key(), node.address());

    let transport = Arc::new(UdpTransport::bind(config.listen).await?);
    let (event_tx, event_rx) = mpsc::channel(1024);
    let receiver = transport.clone();
    tokio::spawn(async move {
        if let Err(e) = receiver.run(event_tx).await {
            error!("UDP receive loop failed: {}", e);
        }
    });

    let (device, mut device_handle) = channel_device("trellis0", 256);
    tokio::spawn(async move {
        while let Some(packet) = device_handle.from_node.recv().await {
            debug!("device received {} bytes", packet.len());
        }
    });

    let (handle, mut task) = spawn_node(
        node,
        transport,
        event_rx,
        device,
        Duration::from_millis(config.tick_ms),
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received shutdown signal");
            handle.shutdown().await;
            task.await??;
        }
        result = &mut task => result??,
    }
    Ok(())
}
