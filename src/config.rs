//! Daemon configuration loaded from `.code-indexer/config.json`.
//!
//! Load order: defaults → JSON file → env vars → validation. Every section
//! is `#[serde(default)]` so older config files keep working as fields are
//! added.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_EVICTION_INTERVAL_SECS, DEFAULT_FILE_EXTENSIONS,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_SAFETY_BUFFER_SECS, DEFAULT_TTL_MINUTES,
    DEFAULT_WATCH_DEBOUNCE_MS,
};
use crate::error::{CidxError, Result};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory of the codebase being indexed. Relative paths resolve
    /// against the parent of the config directory.
    #[serde(default = "default_codebase_dir")]
    pub codebase_dir: PathBuf,

    #[serde(default)]
    pub embedding: EmbeddingSection,

    #[serde(default)]
    pub daemon: DaemonSection,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub indexing: IndexingSection,

    #[serde(default)]
    pub limits: ResourceLimits,
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSection {
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Size of the parallel embedding worker pool
    #[serde(default = "default_parallel_requests")]
    pub parallel_requests: usize,

    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: f64,

    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,
}

/// Daemon lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,

    /// Seconds between TTL eviction checks
    #[serde(default = "default_eviction_interval")]
    pub check_interval_seconds: u64,

    /// Terminate the process when the cache becomes empty after eviction
    #[serde(default)]
    pub auto_shutdown_on_idle: bool,

    /// Per-request socket read/write timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Debounce applied to filesystem watch events
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

/// Settings shared with the server context (validated even though the
/// daemon itself only listens on the local socket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration_minutes: u32,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Indexing behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_safety_buffer")]
    pub safety_buffer_seconds: u64,

    /// File extensions considered for indexing (no leading dot)
    #[serde(default = "default_extensions")]
    pub file_extensions: Vec<String>,

    /// Directory names excluded from discovery, merged with the built-in list
    #[serde(default)]
    pub exclude_dirs: Vec<String>,

    /// Skip files larger than this many bytes
    #[serde(default)]
    pub max_file_size_bytes: Option<u64>,
}

/// Resource limits. All default to unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub max_files: Option<u64>,

    #[serde(default)]
    pub max_repo_size_bytes: Option<u64>,

    #[serde(default)]
    pub max_concurrent_jobs: Option<u64>,
}

fn default_codebase_dir() -> PathBuf {
    PathBuf::from("..")
}

fn default_provider() -> String {
    "voyage-ai".to_string()
}

fn default_model() -> String {
    "voyage-code-3".to_string()
}

fn default_api_endpoint() -> String {
    "https://api.voyageai.com/v1/embeddings".to_string()
}

fn default_parallel_requests() -> usize {
    8
}

fn default_requests_per_minute() -> u32 {
    600
}

fn default_tokens_per_minute() -> u32 {
    1_000_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay_seconds() -> f64 {
    1.0
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_ttl_minutes() -> u64 {
    DEFAULT_TTL_MINUTES
}

fn default_eviction_interval() -> u64 {
    DEFAULT_EVICTION_INTERVAL_SECS
}

fn default_watch_debounce_ms() -> u64 {
    DEFAULT_WATCH_DEBOUNCE_MS
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_jwt_expiration() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_safety_buffer() -> u64 {
    DEFAULT_SAFETY_BUFFER_SECS
}

fn default_extensions() -> Vec<String> {
    DEFAULT_FILE_EXTENSIONS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_endpoint: default_api_endpoint(),
            parallel_requests: default_parallel_requests(),
            requests_per_minute: default_requests_per_minute(),
            tokens_per_minute: default_tokens_per_minute(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
            timeout_seconds: default_request_timeout(),
        }
    }
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            ttl_minutes: default_ttl_minutes(),
            check_interval_seconds: default_eviction_interval(),
            auto_shutdown_on_idle: false,
            request_timeout_seconds: default_request_timeout(),
            watch_debounce_ms: default_watch_debounce_ms(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            jwt_expiration_minutes: default_jwt_expiration(),
            log_level: default_log_level(),
        }
    }
}

impl Default for IndexingSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            safety_buffer_seconds: default_safety_buffer(),
            file_extensions: default_extensions(),
            exclude_dirs: Vec::new(),
            max_file_size_bytes: None,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            codebase_dir: default_codebase_dir(),
            embedding: EmbeddingSection::default(),
            daemon: DaemonSection::default(),
            server: ServerSection::default(),
            indexing: IndexingSection::default(),
            limits: ResourceLimits::default(),
        }
    }
}

/// Log levels accepted by the `log_level` setting and `CIDX_LOG_LEVEL`.
const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warning", "error", "critical"];

impl DaemonConfig {
    /// Load, apply env overrides, and validate in one step.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CidxError::io(path, e))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| CidxError::config(format!("failed to parse {}: {}", path.display(), e)))?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply recognised environment overrides after defaults, before validation.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("CIDX_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("CIDX_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => warn!("ignoring invalid CIDX_PORT value {port:?}"),
            }
        }
        if let Ok(minutes) = std::env::var("CIDX_JWT_EXPIRATION_MINUTES") {
            match minutes.parse() {
                Ok(m) => self.server.jwt_expiration_minutes = m,
                Err(_) => warn!("ignoring invalid CIDX_JWT_EXPIRATION_MINUTES value {minutes:?}"),
            }
        }
        if let Ok(level) = std::env::var("CIDX_LOG_LEVEL") {
            self.server.log_level = level;
        }
    }

    /// Validate the configuration once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(CidxError::config(format!(
                "port must be between 1 and 65535, got {}",
                self.server.port
            )));
        }
        if self.server.jwt_expiration_minutes == 0 {
            return Err(CidxError::config(
                "jwt_expiration_minutes must be greater than 0",
            ));
        }
        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(CidxError::config(format!(
                "log level must be one of {:?}, got {}",
                VALID_LOG_LEVELS, self.server.log_level
            )));
        }
        if self.embedding.parallel_requests == 0 {
            return Err(CidxError::config(
                "embedding.parallel_requests must be at least 1",
            ));
        }
        if self.indexing.batch_size == 0 {
            return Err(CidxError::config("indexing.batch_size must be at least 1"));
        }
        Ok(())
    }

    /// Resolve the codebase directory against the config directory.
    pub fn resolve_codebase_dir(&self, config_dir: &Path) -> PathBuf {
        if self.codebase_dir.is_absolute() {
            self.codebase_dir.clone()
        } else {
            config_dir.join(&self.codebase_dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.embedding.provider, "voyage-ai");
        assert_eq!(config.daemon.ttl_minutes, 10);
        assert_eq!(config.daemon.check_interval_seconds, 60);
        assert!(!config.daemon.auto_shutdown_on_idle);
        assert_eq!(config.indexing.batch_size, 50);
        assert_eq!(config.indexing.safety_buffer_seconds, 60);
        assert_eq!(config.limits.max_files, None);
        assert_eq!(config.limits.max_repo_size_bytes, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file_merges_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"codebase_dir": "/repo", "daemon": {"auto_shutdown_on_idle": true}}"#,
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.codebase_dir, PathBuf::from("/repo"));
        assert!(config.daemon.auto_shutdown_on_idle);
        assert_eq!(config.daemon.ttl_minutes, 10);
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let mut config = DaemonConfig::default();
        config.server.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.server.log_level = "WARNING".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_jwt_expiration() {
        let mut config = DaemonConfig::default();
        config.server.jwt_expiration_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("CIDX_PORT", "9100");
        std::env::set_var("CIDX_LOG_LEVEL", "error");
        let mut config = DaemonConfig::default();
        config.apply_env_overrides();
        std::env::remove_var("CIDX_PORT");
        std::env::remove_var("CIDX_LOG_LEVEL");

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.log_level, "error");
    }

    #[test]
    fn test_resolve_codebase_dir() {
        let config = DaemonConfig::default();
        let resolved = config.resolve_codebase_dir(Path::new("/work/proj/.code-indexer"));
        assert_eq!(resolved, PathBuf::from("/work/proj/.code-indexer/.."));

        let mut abs = DaemonConfig::default();
        abs.codebase_dir = PathBuf::from("/elsewhere");
        assert_eq!(
            abs.resolve_codebase_dir(Path::new("/work/proj/.code-indexer")),
            PathBuf::from("/elsewhere")
        );
    }
}
