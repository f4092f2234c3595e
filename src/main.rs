//! xport server binary.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xport::{Result, Server, ServerConfig};

/// Device tunnel multiplexer.
#[derive(Debug, Parser)]
#[command(name = "xport", version, about)]
struct Args {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port; overrides the configuration file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address; overrides the configuration file.
    #[arg(long)]
    bind: Option<IpAddr>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::new(),
    };
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(bind) = args.bind {
        config = config.with_bind(bind);
    }

    let server = Server::bind(config).await?;
    let shutdown = server.shutdown_handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.shutdown();
            }
            Err(e) => warn!(error = %e, "Cannot listen for interrupt"),
        }
    });

    server.run().await
}
