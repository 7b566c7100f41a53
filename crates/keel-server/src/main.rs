//! `keel-server` binary.

use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use keel_server::{Args, Node, ServerError, SystemEnv, TcpTransport};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let settings = args.settings()?;
    let rpc_addr = args.rpc_addr(&settings)?;
    let node = Node::open(settings, SystemEnv)?;

    let links = TcpTransport::bind(rpc_addr).await?;
    let streams = TcpTransport::bind(args.stream_bind).await?;
    let dialer = Arc::new(TcpTransport::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?);
    node.connect_peers(&dialer);

    tokio::select! {
        result = Arc::clone(&node).serve_links(links) => result?,
        result = Arc::clone(&node).serve_streams(streams) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutting down");
        }
    }
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}
