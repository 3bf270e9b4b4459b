//! WebSocket accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::context::ServerContext;
use crate::net::session;

/// Bind the configured address and serve until the task is dropped.
pub async fn run(ctx: Arc<ServerContext>) -> anyhow::Result<()> {
    let addr = SocketAddr::new(ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening for websocket connections");
    serve(ctx, listener).await
}

/// Accept loop over an already-bound listener. Each connection gets its own
/// task; a failed accept is logged and the loop keeps going.
pub async fn serve(ctx: Arc<ServerContext>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            session::handle_connection(ctx, stream, peer).await;
        });
    }
}
