//! mooring server binary.
//!
//! Loads configuration, sets up logging, and serves the configured
//! protocol until interrupted.

use mooring::config::{ProtocolKind, ServerConfig};
use mooring::protocol::Protocol;
use mooring::protocols::EchoProtocol;
use mooring::server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = ?config.port,
        fork = ?config.fork,
        protocol = ?config.protocol,
        "starting mooring server"
    );

    let protocol: Box<dyn Protocol> = match config.protocol {
        ProtocolKind::Echo => Box::new(EchoProtocol::new()),
    };

    let server = Server::new(config, protocol);
    if let Err(e) = server.start() {
        error!(error = %e, "server failed");
        return Err(e.into());
    }
    Ok(())
}
