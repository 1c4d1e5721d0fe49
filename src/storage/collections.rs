//! Deterministic collection naming.
//!
//! `<base>_<project_id>_<provider_slug>_<model_slug>` where slugs normalise
//! to `[a-z0-9_]+` and the project id is the first 8 hex chars of the
//! SHA-256 of the absolute codebase path.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Normalise a name fragment to `[a-z0-9_]+`, collapsing runs of `_`.
pub fn slug(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_underscore = false;

    for c in value.to_lowercase().chars() {
        let mapped = if c.is_ascii_alphanumeric() { c } else { '_' };
        if mapped == '_' {
            if !last_underscore && !out.is_empty() {
                out.push('_');
            }
            last_underscore = true;
        } else {
            out.push(mapped);
            last_underscore = false;
        }
    }

    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Stable short id for a codebase: first 8 hex chars of SHA-256 of the
/// absolute path.
pub fn project_id(codebase_dir: &Path) -> String {
    let absolute = codebase_dir
        .canonicalize()
        .unwrap_or_else(|_| codebase_dir.to_path_buf());
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..8].to_string()
}

/// Compose the provider-aware collection name. The project id may be
/// omitted when per-project isolation is not required.
pub fn provider_aware_collection_name(
    base: &str,
    provider: &str,
    model: &str,
    project_id: Option<&str>,
) -> String {
    let mut parts = vec![slug(base)];
    if let Some(id) = project_id {
        parts.push(slug(id));
    }
    parts.push(slug(provider));
    parts.push(slug(model));
    parts.retain(|p| !p.is_empty());
    parts.join("_")
}
