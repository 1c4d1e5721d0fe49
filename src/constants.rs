//! Central constants for the daemon configuration
//!
//! All string literals for paths, filenames, and configuration should be defined here
//! to avoid duplication and ensure consistency across the codebase.

/// Name of the per-project configuration directory
pub const CONFIG_DIR_NAME: &str = ".code-indexer";

/// Name of the project configuration file inside the config directory
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Name of the progressive indexing metadata file
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Name of the daemon socket file (binding it is the single-instance lock)
pub const SOCKET_FILE_NAME: &str = "daemon.sock";

/// Name of the daemon log file
pub const LOG_FILE_NAME: &str = "daemon.log";

/// Name of the vector index directory inside the config directory
pub const INDEX_DIR_NAME: &str = "index";

/// Name of the full-text index directory inside the config directory
pub const FTS_DIR_NAME: &str = "tantivy_index";

/// Name of the per-collection metadata file (freshness contract)
pub const COLLECTION_META_FILE: &str = "collection_meta.json";

/// Name of the temporal (git-history) collection
pub const TEMPORAL_COLLECTION_NAME: &str = "code-indexer-temporal";

/// Base name for the workspace collection, before provider/model slugs
pub const DEFAULT_COLLECTION_BASE: &str = "code-indexer";

/// Cache entry time-to-live in minutes
pub const DEFAULT_TTL_MINUTES: u64 = 10;

/// Seconds between TTL eviction checks
pub const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 60;

/// RPC request timeout in seconds (long operations such as blocking indexing)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Point batch size flushed to the vector store in a single upsert
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Safety buffer subtracted from the resume timestamp for incremental runs
pub const DEFAULT_SAFETY_BUFFER_SECS: u64 = 60;

/// Upper bound on elements loaded into a cached semantic index
pub const MAX_CACHED_ELEMENTS: usize = 100_000;

/// Page size used when scrolling every point of a collection
pub const SCROLL_PAGE_SIZE: usize = 1000;

/// Tolerance in seconds when comparing disk mtimes to database timestamps
pub const RECONCILE_MTIME_TOLERANCE_SECS: f64 = 1.0;

/// File watcher debounce time in milliseconds
pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 2000;

/// LMDB map size per collection in MB
pub const DEFAULT_LMDB_MAP_SIZE_MB: usize = 2048;

/// Directories that should always be excluded from indexing
pub const ALWAYS_EXCLUDED: &[&str] = &[
    // Our own state
    ".code-indexer",
    // Version control
    ".git",
    ".svn",
    ".hg",
    // Build artifacts
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    // Python
    "__pycache__",
    ".pytest_cache",
    ".tox",
    "venv",
    ".venv",
    // Ruby
    "vendor",
    ".bundle",
    // Java
    ".gradle",
    ".m2",
    // IDE
    ".idea",
    ".vscode",
    ".vs",
    // Other
    "coverage",
    ".nyc_output",
    ".cache",
];

/// Default file extensions considered for indexing when the config does not list any
pub const DEFAULT_FILE_EXTENSIONS: &[&str] = &[
    "rs", "py", "pyi", "js", "mjs", "cjs", "jsx", "ts", "tsx", "go", "java", "kt", "c", "h",
    "cpp", "cc", "hpp", "cs", "rb", "php", "swift", "sh", "bash", "scala", "sql", "html", "css",
    "scss", "vue", "svelte", "json", "yaml", "yml", "toml", "xml", "md", "markdown", "proto",
    "graphql",
];
