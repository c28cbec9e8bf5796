use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crosstalk_rust::server::{self, ServerConfig};

/// Conversation sync server.
#[derive(Debug, Parser)]
#[command(name = "crosstalk-server", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: SocketAddr,

    /// Path of the sqlite revision store.
    #[arg(long, default_value = "crosstalk-server.db")]
    db_path: PathBuf,

    /// Request body cap in bytes.
    #[arg(long, default_value_t = 1024 * 1024)]
    max_body_bytes: usize,

    /// Seconds between events keep-alives.
    #[arg(long, default_value_t = 25)]
    keepalive_secs: u64,

    /// Seconds before an events stream is force-closed.
    #[arg(long, default_value_t = 60)]
    stream_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: args.bind,
        db_path: args.db_path,
        max_body_bytes: args.max_body_bytes,
        keepalive_interval: Duration::from_secs(args.keepalive_secs),
        stream_ttl: Duration::from_secs(args.stream_ttl_secs),
        ..ServerConfig::default()
    };

    server::run(config).await
}
