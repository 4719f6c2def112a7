//! scriptgate: scriptable HTTP gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ net::Listener ──▶ http::server ──▶ dispatch::Dispatcher
//!                                                           │
//!                                    ┌──────────────────────┼─────────────────────┐
//!                                    ▼                      ▼                     ▼
//!                             vhost::cache           routing::Router        geo (region)
//!                         (router files by host)   (first matching route)
//!                                                           │
//!                                                           ▼
//!                                                  script (Lua handler chain,
//!                                                     ctx control surface)
//!                                                           │
//!     Client Response                                       ▼
//!     ◀────────────── http::response ◀─────────── access_log (per host / global)
//! ```

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;

use scriptgate::config::load_config;
use scriptgate::lifecycle::shutdown_signal;
use scriptgate::observability::{logging::init_logging, metrics::init_metrics};
use scriptgate::Server;

#[derive(Parser)]
#[command(name = "scriptgate")]
#[command(about = "Scriptable HTTP gateway", long_about = None)]
struct Cli {
    /// Path to the gateway config file.
    #[arg(short, long, default_value = "scriptgate.toml")]
    config: PathBuf,

    /// Validate the config and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    if cli.check {
        println!("{}: ok", cli.config.display());
        return Ok(());
    }

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "scriptgate starting");

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        router_dir = %config.vhost.router_dir,
        handler_dir = %config.vhost.handler_dir,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = Server::new(config)?;
    server.start()?;

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = server.wait() => {}
    }

    server.close().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
