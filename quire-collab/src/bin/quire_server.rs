//! quire-server — standalone collaboration server.
//!
//! Environment:
//! - `QUIRE_BIND` — listen address (default `127.0.0.1:9090`)
//! - `QUIRE_DATA` — RocksDB directory; unset keeps documents in memory
//! - `RUST_LOG`   — log filter (default `info`)

use std::sync::Arc;

use log::{error, info};
use quire_collab::{CollabServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    match &config.storage_path {
        Some(path) => info!("Persisting documents to {}", path.display()),
        None => info!("No QUIRE_DATA set; documents live in memory only"),
    }

    let server = match CollabServer::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!("Failed to open document store: {e}");
            std::process::exit(1);
        }
    };

    let runner = server.clone();
    tokio::select! {
        result = runner.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            let saved = server.registry().flush_all().await;
            info!("Saved {saved} open document(s)");
        }
    }
}
