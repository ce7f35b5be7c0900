//! mage-tower server binary.

use mage_tower::config::Config;
use mage_tower::logging;
use mage_tower::server::Server;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    logging::init(&config.log_level, std::io::stdout);

    info!(
        host = %config.host,
        port = config.port,
        buffer_size = config.buffer_size,
        backlog = config.backlog,
        framing = ?config.framing,
        idle_timeout = ?config.idle_timeout,
        "Starting Mage's Tower server"
    );

    let server = Server::bind(&config).map_err(|e| {
        error!(error = %e, "Failed to start server");
        e
    })?;
    let counter = server.counter();

    let drain = server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    if !drain.is_empty() {
        info!(
            handlers = drain.len(),
            active = counter.current(),
            "Waiting for open connections to close (interrupt again to exit now)"
        );
        tokio::select! {
            _ = drain.wait() => {}
            _ = tokio::signal::ctrl_c() => {
                warn!(active = counter.current(), "Exiting with connections still open");
            }
        }
    }

    info!("Server stopped");
    Ok(())
}
