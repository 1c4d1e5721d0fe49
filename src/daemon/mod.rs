//! Per-project daemon over a Unix stream socket.
//!
//! Binding `<config_dir>/daemon.sock` is the single-instance lock: only
//! one daemon can own a project at a time, with stale-socket probing for
//! crashed predecessors. A single service instance is shared across all
//! connections so cache, watch, and indexing state are process-global.

pub mod cache;
pub mod client;
pub mod protocol;
pub mod server;
pub mod service;
pub mod watch_manager;

use std::path::Path;

use tracing::info;

use crate::config::DaemonConfig;
use crate::error::Result;
use crate::logger::{init_daemon_logging, LogLevel};

pub use client::DaemonClient;
pub use server::{claim_socket, socket_path};
pub use service::DaemonService;

/// Start the daemon for a project config file and serve until shutdown.
///
/// SIGTERM/SIGINT unlink the socket and exit 0; every other exit path
/// removes the socket before returning.
pub fn run(config_path: &Path, verbose: bool) -> Result<()> {
    let config_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let config = DaemonConfig::load(config_path)?;

    let level = if verbose {
        LogLevel::Debug
    } else {
        LogLevel::parse(&config.server.log_level).unwrap_or(LogLevel::Info)
    };
    let _log_guard = init_daemon_logging(&config_dir, level)?;

    info!("starting daemon for {}", config_dir.display());

    let socket = socket_path(&config_dir);
    let listener = claim_socket(&socket)?;

    // Signal-driven shutdown: unlink the socket and exit cleanly
    let signal_socket = socket.clone();
    ctrlc::set_handler(move || {
        info!("received termination signal, shutting down");
        let _ = std::fs::remove_file(&signal_socket);
        std::process::exit(0);
    })
    .map_err(|e| crate::error::CidxError::config(format!("failed to install signal handler: {e}")))?;

    let service = DaemonService::new(config, config_dir)?;

    info!("daemon listening on {}", socket.display());
    println!("cidx daemon started on {}", socket.display());

    let result = server::serve(listener, service);

    // Cleanup on every exit path
    let _ = std::fs::remove_file(&socket);
    info!("socket removed, daemon exiting");

    result
}
