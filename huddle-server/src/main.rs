//! Huddle sync server.
//!
//! ```text
//! huddle-server [config.toml]
//! ```
//!
//! The config path may also come from `HUDDLE_CONFIG`; `HUDDLE_BIND`
//! overrides `bind_addr`. Logging is controlled by `RUST_LOG`.

use std::process::ExitCode;

use huddle_collab::{ServerConfig, SyncServer};
use log::{error, info};

fn load_config() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let path = std::env::args().nth(1).or_else(|| std::env::var("HUDDLE_CONFIG").ok());
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from {path}");
            ServerConfig::load(path)?
        }
        None => ServerConfig::default(),
    };
    if let Ok(bind) = std::env::var("HUDDLE_BIND") {
        config.bind_addr = bind;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if config.tickets.is_empty() {
        log::warn!("No tickets configured; every connection will be refused");
    }

    let server = match SyncServer::from_config(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Cannot open storage: {e}");
            return ExitCode::FAILURE;
        }
    };
    let maintenance = server.spawn_maintenance();

    let outcome = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    maintenance.abort();
    server.shutdown().await;

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Server stopped: {e}");
            ExitCode::FAILURE
        }
    }
}
