use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vantown_server::config::ServerConfig;
use vantown_server::context::ServerContext;
use vantown_server::net::server;
use vantown_server::sim;
use vantown_server::util::now_ms;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging, overridable via RUST_LOG
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Vantown Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    if let Err(e) = config.validate() {
        anyhow::bail!("invalid configuration: {}", e);
    }
    info!(
        "Configuration loaded: {}:{}, tick_hz={}, data_dir={}",
        config.bind_address, config.port, config.tick_hz, config.data_dir
    );

    // Initialize shared state and the always-on default zone
    let ctx = Arc::new(ServerContext::new(config));
    ctx.boot(now_ms());

    // Start the fixed-rate simulation and maintenance loops
    sim::start(Arc::clone(&ctx));

    // Shutdown signal handler
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    // Run server with graceful shutdown
    tokio::select! {
        result = server::run(Arc::clone(&ctx)) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    info!("Server stopped");
    Ok(())
}
