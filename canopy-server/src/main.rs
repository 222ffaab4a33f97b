//! Canopy sync server.
//!
//! Configuration comes from the environment:
//!
//! | Variable            | Default           |
//! |---------------------|-------------------|
//! | `CANOPY_BIND_ADDR`  | `127.0.0.1:9090`  |
//! | `CANOPY_DATA_DIR`   | `canopy_server_data` |
//! | `CANOPY_PAGE_LIMIT` | `1000`            |
//!
//! Log output is controlled with `RUST_LOG`.

use canopy_collab::{ServerConfig, SyncServer};
use log::{error, info, warn};
use std::path::PathBuf;

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("CANOPY_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(dir) = std::env::var("CANOPY_DATA_DIR") {
        config.storage_path = PathBuf::from(dir);
    }
    if let Ok(limit) = std::env::var("CANOPY_PAGE_LIMIT") {
        match limit.parse::<usize>() {
            Ok(limit) if limit > 0 => config.max_page_size = limit,
            _ => warn!("Ignoring invalid CANOPY_PAGE_LIMIT={limit}"),
        }
    }
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from_env();
    info!("Starting Canopy sync server on {}...", config.bind_addr);

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open server store: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
