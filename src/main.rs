//! line-relay: rebroadcast every received line to all other clients.
//!
//! Usage: `line-relay <HOST> <PORT> [--config FILE]`

use line_relay::{runtime, Config};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        read_buffer = config.read_buffer_size,
        write_buffer = config.write_buffer_size(),
        max_connections = config.max_connections,
        "Starting line relay"
    );

    match runtime::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, errno = ?e.os_error(), "Fatal error");
            ExitCode::FAILURE
        }
    }
}
