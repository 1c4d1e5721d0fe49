//! Wire protocol types.
//!
//! Newline-delimited JSON over the Unix socket. A request names an
//! operation with typed parameters; the daemon answers with exactly one
//! response per request id, optionally preceded by progress events for
//! streaming operations. Everything crossing the boundary is a plain value
//! type; there are no proxies or handles in payloads.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A client → daemon message. `cancel` lines interleave with an in-flight
/// streaming operation to request cooperative interruption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: u64,

    #[serde(default)]
    pub op: String,

    #[serde(default)]
    pub params: serde_json::Value,

    #[serde(default)]
    pub cancel: bool,
}

/// A daemon → client response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, kind: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                status: "error".to_string(),
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// Uniform error envelope: `{status: "error", message, kind}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub status: String,
    pub kind: String,
    pub message: String,
}

/// A daemon → client progress event, emitted before the final response of
/// streaming operations. `concurrent_files_json` is pre-serialised server
/// side so no structured proxy crosses the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: u64,
    pub event: String,
    pub current: usize,
    pub total: usize,
    pub file_path: String,
    pub info: String,
    #[serde(default)]
    pub concurrent_files_json: String,
    pub correlation_id: u64,
}

// ── Operation parameters ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParams {
    pub project: PathBuf,
    pub query: String,

    #[serde(default = "default_limit")]
    pub limit: usize,

    #[serde(default)]
    pub languages: Vec<String>,

    #[serde(default)]
    pub exclude_languages: Vec<String>,

    #[serde(default)]
    pub path_filter: Vec<String>,

    #[serde(default)]
    pub exclude_paths: Vec<String>,

    #[serde(default)]
    pub min_score: Option<f32>,

    #[serde(default = "default_accuracy")]
    pub accuracy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtsQueryParams {
    pub project: PathBuf,
    pub query: String,

    #[serde(default = "default_limit")]
    pub limit: usize,

    #[serde(default)]
    pub edit_distance: u8,

    #[serde(default)]
    pub case_sensitive: bool,

    #[serde(default)]
    pub use_regex: bool,

    #[serde(default = "default_snippet_lines")]
    pub snippet_lines: usize,

    #[serde(default)]
    pub languages: Vec<String>,

    #[serde(default)]
    pub exclude_languages: Vec<String>,

    #[serde(default)]
    pub path_filters: Vec<String>,

    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalQueryParams {
    pub project: PathBuf,
    pub query: String,

    /// `"all"`, `"last-N-days"`, or `"YYYY-MM-DD..YYYY-MM-DD"`
    pub time_range: String,

    #[serde(default = "default_limit")]
    pub limit: usize,

    #[serde(default)]
    pub languages: Vec<String>,

    #[serde(default)]
    pub exclude_languages: Vec<String>,

    #[serde(default)]
    pub path_filter: Vec<String>,

    #[serde(default)]
    pub exclude_path: Vec<String>,

    #[serde(default)]
    pub min_score: Option<f32>,

    #[serde(default = "default_accuracy")]
    pub accuracy: String,

    /// `commit_message` or `commit_diff`
    #[serde(default)]
    pub chunk_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexParams {
    pub project: PathBuf,

    #[serde(default)]
    pub force_full: bool,

    #[serde(default)]
    pub reconcile_with_database: bool,

    #[serde(default)]
    pub batch_size: Option<usize>,

    #[serde(default)]
    pub enable_fts: bool,

    #[serde(default)]
    pub files_count_to_process: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchParams {
    pub project: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanParams {
    pub project: PathBuf,

    #[serde(default)]
    pub collection: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusParams {
    pub project: PathBuf,
}

fn default_limit() -> usize {
    10
}

fn default_accuracy() -> String {
    "balanced".to_string()
}

fn default_snippet_lines() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_roundtrip() {
        let line = r#"{"id": 7, "op": "query", "params": {"project": "/p", "query": "auth"}}"#;
        let request: RpcRequest = serde_json::from_str(line).unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(request.op, "query");
        assert!(!request.cancel);

        let params: QueryParams = serde_json::from_value(request.params).unwrap();
        assert_eq!(params.limit, 10);
        assert_eq!(params.accuracy, "balanced");
        assert!(params.path_filter.is_empty());
    }

    #[test]
    fn test_error_envelope_shape() {
        let response = RpcResponse::err(3, "invalid_time_range", "bad range");
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["status"], "error");
        assert_eq!(value["error"]["kind"], "invalid_time_range");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_list_parameters_stay_lists() {
        // A path filter must arrive as a list, never a character splat
        let params: TemporalQueryParams = serde_json::from_value(serde_json::json!({
            "project": "/p",
            "query": "refactor",
            "time_range": "all",
            "path_filter": ["*.py"],
            "exclude_path": ["*/tests/*"],
        }))
        .unwrap();
        assert_eq!(params.path_filter, vec!["*.py".to_string()]);
        assert_eq!(params.exclude_path, vec!["*/tests/*".to_string()]);

        // A bare string is a type error, not a silent splat
        let bad: std::result::Result<TemporalQueryParams, _> =
            serde_json::from_value(serde_json::json!({
                "project": "/p",
                "query": "refactor",
                "time_range": "all",
                "path_filter": "*.py",
            }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_cancel_message() {
        let request: RpcRequest = serde_json::from_str(r#"{"cancel": true}"#).unwrap();
        assert!(request.cancel);
        assert!(request.op.is_empty());
    }
}
