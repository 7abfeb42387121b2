//! Interactive chat client.
//!
//! Connects to a home server, prints incoming messages as they arrive, and
//! reads commands from stdin: view messages, send public or private chat,
//! list users, upload and download files.

use anyhow::Result;
use clap::Parser;
use olafchat_core::client::ClientSession;
use olafchat_core::config::ClientConfig;
use tracing_subscriber::EnvFilter;

mod commands;

/// OLAF/Neighbourhood chat client
#[derive(Parser)]
#[command(name = "olafchat")]
#[command(author, version, about)]
struct Args {
    /// Home server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Home server port
    #[arg(short, long, default_value = "4678")]
    port: u16,

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
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let server_addr = format!("{}:{}", args.host, args.port);
    let config = ClientConfig {
        server_addr: server_addr.clone(),
    };

    println!("Generating identity key...");
    let (handle, events) = ClientSession::connect(config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to {}: {}", server_addr, e))?;

    println!("Connected to {}", server_addr);
    println!("Your fingerprint: {}", handle.fingerprint());

    commands::run(handle, events, server_addr).await
}
