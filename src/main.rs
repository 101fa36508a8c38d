//! line-relay: a single-threaded TCP line relay
//!
//! Clients connect over loopback and send newline-terminated text. Every
//! complete line is rebroadcast to all other clients as `client <id>: <line>`,
//! and arrivals and departures are announced by the server.
//!
//! Features:
//! - One thread, readiness-based I/O (epoll/kqueue via mio)
//! - Lines reassembled across any number of partial reads
//! - Slow readers are skipped rather than stalling the relay
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod relay;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration; usage errors exit here before any socket exists
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        port = config.port,
        backlog = config.backlog,
        recv_buffer_size = config.recv_buffer_size,
        read_errors = ?config.read_errors,
        "Starting line-relay"
    );

    // The failure has already been logged and connections released
    if relay::run(config).is_err() {
        std::process::exit(1);
    }

    Ok(())
}
