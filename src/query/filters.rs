//! Unified filter construction for semantic and temporal queries.
//!
//! The daemon composes a single [`FilterConditions`] object with `must`
//! (AND) and `must_not` (NOT) clauses: language inclusion resolves a
//! language name to its known extensions, path inclusion becomes a
//! substring match, language exclusion adds one `must_not` clause per
//! extension, and path exclusion goes through [`PathFilterBuilder`] glob
//! patterns. Invalid language tags are logged and skipped; the operation
//! proceeds with the remaining clauses.

use std::collections::BTreeSet;

use globset::{Glob, GlobMatcher};
use tracing::warn;

use crate::error::Result;
use crate::storage::PointPayload;

/// One filter clause evaluated against a point payload.
#[derive(Debug, Clone)]
pub enum FilterClause {
    /// Payload language must be one of the listed extensions
    LanguageIn(BTreeSet<String>),
    /// Payload language equals this extension (used for exclusions)
    LanguageIs(String),
    /// Payload path contains this fragment
    PathContains(String),
    /// Payload path matches this glob (used for exclusions)
    PathGlob(GlobMatcher),
}

impl FilterClause {
    fn matches(&self, payload: &PointPayload) -> bool {
        match self {
            Self::LanguageIn(extensions) => extensions.contains(&payload.language),
            Self::LanguageIs(extension) => payload.language == *extension,
            Self::PathContains(fragment) => payload.path.contains(fragment.as_str()),
            Self::PathGlob(matcher) => matcher.is_match(&payload.path),
        }
    }
}

/// Composed filter: every `must` clause must hold, no `must_not` clause may.
#[derive(Debug, Clone, Default)]
pub struct FilterConditions {
    pub must: Vec<FilterClause>,
    pub must_not: Vec<FilterClause>,
}

impl FilterConditions {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty()
    }

    pub fn matches(&self, payload: &PointPayload) -> bool {
        self.must.iter().all(|c| c.matches(payload))
            && !self.must_not.iter().any(|c| c.matches(payload))
    }

    /// Build the unified filter from the raw RPC parameters. List-typed
    /// parameters arrive as real lists; the typed signature is the contract
    /// that prevents string-splat bugs at the boundary.
    pub fn build(
        languages: &[String],
        exclude_languages: &[String],
        path_filter: &[String],
        exclude_paths: &[String],
    ) -> Result<Self> {
        let mapper = LanguageMapper::new();
        let mut conditions = FilterConditions::default();

        for lang in languages {
            match mapper.extensions(lang) {
                Some(extensions) => conditions
                    .must
                    .push(FilterClause::LanguageIn(extensions.clone())),
                None => warn!("invalid language filter, skipping: {lang}"),
            }
        }

        for fragment in path_filter {
            conditions
                .must
                .push(FilterClause::PathContains(fragment.clone()));
        }

        for lang in exclude_languages {
            match mapper.extensions(lang) {
                Some(extensions) => {
                    for ext in extensions {
                        conditions
                            .must_not
                            .push(FilterClause::LanguageIs(ext.clone()));
                    }
                }
                None => warn!("invalid exclusion language, skipping: {lang}"),
            }
        }

        conditions
            .must_not
            .extend(PathFilterBuilder::new().build_exclusion_filters(exclude_paths)?);

        Ok(conditions)
    }
}

/// Maps human language names to the file extensions the indexer records.
pub struct LanguageMapper {
    table: Vec<(&'static str, &'static [&'static str])>,
}

impl LanguageMapper {
    pub fn new() -> Self {
        Self {
            table: vec![
                ("rust", &["rs"]),
                ("python", &["py", "pyi", "pyw"]),
                ("javascript", &["js", "mjs", "cjs", "jsx"]),
                ("typescript", &["ts", "tsx", "mts", "cts"]),
                ("go", &["go"]),
                ("java", &["java"]),
                ("kotlin", &["kt", "kts"]),
                ("c", &["c", "h"]),
                ("cpp", &["cpp", "cc", "cxx", "hpp", "hxx"]),
                ("csharp", &["cs"]),
                ("ruby", &["rb", "rake"]),
                ("php", &["php"]),
                ("swift", &["swift"]),
                ("scala", &["scala"]),
                ("shell", &["sh", "bash", "zsh"]),
                ("sql", &["sql"]),
                ("html", &["html", "htm"]),
                ("css", &["css", "scss", "sass", "less"]),
                ("vue", &["vue"]),
                ("markdown", &["md", "markdown"]),
                ("json", &["json"]),
                ("yaml", &["yaml", "yml"]),
                ("toml", &["toml"]),
                ("xml", &["xml"]),
                ("protobuf", &["proto"]),
                ("graphql", &["graphql", "gql"]),
            ],
        }
    }

    /// Extensions for a language name, or `None` when the tag is unknown.
    /// A bare extension that appears in the table is accepted as itself.
    pub fn extensions(&self, language: &str) -> Option<BTreeSet<String>> {
        let needle = language.to_lowercase();
        for (name, extensions) in &self.table {
            if *name == needle {
                return Some(extensions.iter().map(|e| e.to_string()).collect());
            }
        }
        // Accept a raw extension spelled directly (e.g. "rs", "py")
        for (_, extensions) in &self.table {
            if extensions.contains(&needle.as_str()) {
                return Some(std::iter::once(needle).collect());
            }
        }
        None
    }

    pub fn is_known(&self, language: &str) -> bool {
        self.extensions(language).is_some()
    }
}

impl Default for LanguageMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds glob-based path exclusion clauses (`*/tests/*` and friends).
#[derive(Default)]
pub struct PathFilterBuilder;

impl PathFilterBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build_exclusion_filters(&self, patterns: &[String]) -> Result<Vec<FilterClause>> {
        let mut clauses = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            // Default glob semantics let `*` span separators, matching the
            // shell-style patterns clients pass
            let matcher = Glob::new(pattern)?.compile_matcher();
            clauses.push(FilterClause::PathGlob(matcher));
        }
        Ok(clauses)
    }
}
