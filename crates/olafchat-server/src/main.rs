//! OLAF/Neighbourhood home server.
//!
//! Serves the WebSocket endpoint at `/` and the file-transfer surface
//! (`POST /api/upload`, `GET /downloads/<name>`) on one host:port, and
//! dials the configured neighbourhood.

use anyhow::Result;
use clap::Parser;
use olafchat_core::config::ServerConfig;
use olafchat_core::crypto::IdentityKeypair;
use olafchat_core::server::{neighbourhood, ServerNode};
use olafchat_server::{build_router, AppState, FileStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// OLAF/Neighbourhood home server
#[derive(Parser)]
#[command(name = "olafchat-server")]
#[command(author, version, about)]
struct Args {
    /// Bind host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port
    #[arg(short, long, default_value = "4678")]
    port: u16,

    /// Neighbour server address as host:port (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Directory for uploaded files
    #[arg(long, default_value = "./uploads")]
    upload_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        neighbours: args.peers.clone(),
    };

    info!("generating server identity key");
    let identity = IdentityKeypair::generate()
        .map_err(|e| anyhow::anyhow!("failed to generate identity: {}", e))?;

    let node = ServerNode::new(config, identity)
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
    let public_addr = node.address();

    let files = FileStore::new(args.upload_dir.clone()).await?;
    let state = Arc::new(AppState {
        node: Arc::clone(&node),
        files,
        public_addr,
    });

    neighbourhood::spawn(Arc::clone(&node));

    let app = build_router(state);
    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!(
        address = %bind_addr,
        neighbours = args.peers.len(),
        "home server started"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
