//! line-relay: a single-threaded TCP line relay
//!
//! Every client connects, sends newline-terminated lines, and receives
//! every other client's lines prefixed with the sender's identifier.
//!
//! Features:
//! - One thread multiplexing all sockets with mio
//! - Per-client line framing and outbound queues
//! - Arrival and departure notices
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::{Config, ConfigError};
use std::io::IsTerminal;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            if let (true, ConfigError::Args(e)) = (err.is_informational(), &err) {
                let _ = e.print();
                return ExitCode::SUCCESS;
            }
            eprintln!("{}", err.diagnostic());
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        read_chunk_size = config.read_chunk_size,
        "Starting line-relay"
    );

    match runtime::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Cause shows up at debug level only.
            debug!(error = %e, "Relay stopped");
            eprintln!("Fatal error");
            ExitCode::FAILURE
        }
    }
}
