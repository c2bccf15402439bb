//! Parlor chat server binary
//!
//! Configuration comes from `PARLOR_*` environment variables; see
//! `ServerConfig::from_env`.

use parlor::{ChatServer, ServerConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let config = ServerConfig::from_env();
    info!("Starting parlor chat server on {}", config.bind_addr);

    let mut server = ChatServer::new(config)?;
    server.bind().await?;

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
