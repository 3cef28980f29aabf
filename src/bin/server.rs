//! Signaling server entry point
//!
//! ```bash
//! pairchat-server --listen 0.0.0.0:5000 --pairing fifo
//! PAIRCHAT_PAIRING=random RUST_LOG=pairchat=trace pairchat-server
//! ```

use anyhow::Context;
use clap::{Parser, ValueEnum};
use pairchat::{PairingPolicy, ServerConfig, SignalingServer};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Pairing {
    Fifo,
    Random,
}

impl From<Pairing> for PairingPolicy {
    fn from(value: Pairing) -> Self {
        match value {
            Pairing::Fifo => PairingPolicy::Fifo,
            Pairing::Random => PairingPolicy::Random,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "pairchat-server", version, about = "Anonymous 1:1 chat signaling server")]
struct Args {
    /// Address to accept WebSocket connections on
    #[arg(long, env = "PAIRCHAT_LISTEN", default_value = "0.0.0.0:5000")]
    listen: SocketAddr,

    /// How waiting participants are matched
    #[arg(long, env = "PAIRCHAT_PAIRING", value_enum, default_value_t = Pairing::Fifo)]
    pairing: Pairing,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    pairchat::init_tracing(&["pairchat=debug"]);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Pairchat server starting");

    let config = ServerConfig {
        listen_addr: args.listen,
        pairing: args.pairing.into(),
    };
    let server = SignalingServer::bind(&config)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tokio::select! {
        result = server.run() => result.context("accept loop failed")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }
    Ok(())
}
