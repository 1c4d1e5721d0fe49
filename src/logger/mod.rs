//! Centralized logging for the daemon process.
//!
//! The subscriber is installed once at daemon boot: an stderr layer for
//! interactive runs plus a file layer writing `<config_dir>/daemon.log`.
//! Library code logs through `tracing` macros and never configures global
//! state itself.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::constants::LOG_FILE_NAME;
use crate::error::{CidxError, Result};

/// Log level configuration. Accepts the config-file names (`warning`,
/// `critical`) as well as the conventional tracing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" | "critical" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" | "trace" => Some(LogLevel::Debug),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Install the global subscriber for the daemon process.
///
/// Returns the appender guard; dropping it stops the background writer, so
/// the caller must hold it for the life of the process.
pub fn init_daemon_logging(
    config_dir: &Path,
    level: LogLevel,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(config_dir).map_err(|e| CidxError::io(config_dir, e))?;

    let file_appender = tracing_appender::rolling::never(config_dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("cidx_daemon={}", level.as_str()).into());

    // stderr for interactive runs; stdout stays reserved for program output
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .map_err(|e| CidxError::config(format!("failed to install tracing subscriber: {e}")))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("CRITICAL"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("nope"), None);
    }
}
