//! Best-effort staleness detection for semantic results.
//!
//! A result is stale when the file on disk is newer than the index version
//! that produced it. Detection compares the payload's recorded
//! `file_last_modified` (falling back to a live `stat`) against the indexed
//! timestamp parsed from `indexed_at` (ISO) or the numeric mtime field.
//!
//! The detector sorts its working set, so enrichment is applied back to the
//! caller's results keyed by file path rather than by position.

use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use crate::storage::PointPayload;

/// Staleness metadata attached to a result.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Staleness {
    pub is_stale: bool,
    pub staleness_indicator: String,
    pub staleness_delta_seconds: f64,
}

pub struct StalenessDetector {
    /// Slack allowed before a newer mtime counts as stale
    tolerance_seconds: f64,
}

impl Default for StalenessDetector {
    fn default() -> Self {
        Self {
            tolerance_seconds: 1.0,
        }
    }
}

impl StalenessDetector {
    pub fn new(tolerance_seconds: f64) -> Self {
        Self { tolerance_seconds }
    }

    /// Compute staleness for each payload, returning a map keyed by file
    /// path. Failures for individual files simply omit the entry.
    pub fn detect<'a>(
        &self,
        project_root: &Path,
        payloads: impl Iterator<Item = &'a PointPayload>,
    ) -> HashMap<String, Staleness> {
        let mut entries: Vec<(String, f64, f64)> = Vec::new();

        for payload in payloads {
            let Some(indexed_ts) = indexed_timestamp(payload) else {
                continue;
            };
            let Some(file_mtime) = file_last_modified(project_root, payload) else {
                continue;
            };
            entries.push((payload.path.clone(), file_mtime, indexed_ts));
        }

        // Freshest-first ordering; this reordering is why callers must
        // join on path, never on index position.
        entries.sort_by(|a, b| {
            let delta_a = a.1 - a.2;
            let delta_b = b.1 - b.2;
            delta_a.partial_cmp(&delta_b).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut map = HashMap::with_capacity(entries.len());
        for (path, file_mtime, indexed_ts) in entries {
            let delta = file_mtime - indexed_ts;
            let is_stale = delta > self.tolerance_seconds;
            let indicator = if is_stale {
                format!("stale ({delta:.0}s behind)")
            } else {
                "fresh".to_string()
            };
            map.insert(
                path,
                Staleness {
                    is_stale,
                    staleness_indicator: indicator,
                    staleness_delta_seconds: delta.max(0.0),
                },
            );
        }
        map
    }
}

fn indexed_timestamp(payload: &PointPayload) -> Option<f64> {
    if !payload.indexed_at.is_empty() {
        if let Some(ts) = parse_iso_timestamp(&payload.indexed_at) {
            return Some(ts);
        }
    }
    payload.filesystem_mtime
}

fn parse_iso_timestamp(value: &str) -> Option<f64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp() as f64);
    }
    let trimmed = value.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().timestamp() as f64)
}

fn file_last_modified(project_root: &Path, payload: &PointPayload) -> Option<f64> {
    if let Some(mtime) = payload.file_last_modified {
        return Some(mtime);
    }
    let candidate = Path::new(&payload.path);
    let path = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        project_root.join(candidate)
    };
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}

/// Format the current moment the way point payloads record `indexed_at`.
pub fn format_indexed_at(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn payload(path: &str, indexed_at: &str, file_mtime: Option<f64>) -> PointPayload {
        PointPayload {
            path: path.to_string(),
            indexed_at: indexed_at.to_string(),
            file_last_modified: file_mtime,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_iso_timestamp_variants() {
        assert!(parse_iso_timestamp("2025-06-01T10:00:00Z").is_some());
        assert!(parse_iso_timestamp("2025-06-01T10:00:00+00:00").is_some());
        assert!(parse_iso_timestamp("not a date").is_none());
    }

    #[test]
    fn test_enrichment_is_keyed_by_path_despite_reorder() {
        let detector = StalenessDetector::default();
        // stale.rs modified 500s after indexing; fresh.rs untouched
        let stale = payload("stale.rs", "2025-06-01T10:00:00Z", Some(1_748_772_500.0));
        let fresh = payload("fresh.rs", "2025-06-01T10:00:00Z", Some(1_748_772_000.0));
        // indexed_at 2025-06-01T10:00:00Z == 1748772000

        let map = detector.detect(Path::new("/proj"), [&stale, &fresh].into_iter());

        let stale_entry = map.get("stale.rs").unwrap();
        assert!(stale_entry.is_stale);
        assert!(stale_entry.staleness_delta_seconds > 400.0);

        let fresh_entry = map.get("fresh.rs").unwrap();
        assert!(!fresh_entry.is_stale);
        assert_eq!(fresh_entry.staleness_indicator, "fresh");
    }

    #[test]
    fn test_tolerance_suppresses_clock_skew() {
        let detector = StalenessDetector::new(2.0);
        let p = payload("a.rs", "2025-06-01T10:00:00Z", Some(1_748_772_001.5));
        let map = detector.detect(Path::new("/proj"), std::iter::once(&p));
        assert!(!map.get("a.rs").unwrap().is_stale);
    }

    #[test]
    fn test_unresolvable_entries_are_omitted() {
        let detector = StalenessDetector::default();
        let p = payload("/definitely/not/a/file.rs", "", None);
        let map = detector.detect(Path::new("/proj"), std::iter::once(&p));
        assert!(map.is_empty());
    }
}
