//! Tantivy-based full-text search index.
//!
//! One document per indexed file, stored under
//! `<config_dir>/tantivy_index/`. The searcher accepts the full option set
//! of the `query_fts` operation: fuzzy edit distance, case sensitivity,
//! regex, snippet line count, and language/path include/exclude filters.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, Query, QueryParser, RegexQuery};
use tantivy::schema::{Field, NumericOptions, Schema, Value, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexSettings, IndexWriter, TantivyDocument, Term};
use tracing::debug;

use crate::error::{CidxError, Result};
use crate::query::FilterConditions;
use crate::storage::PointPayload;

/// Search options for one FTS query.
#[derive(Debug, Clone)]
pub struct FtsSearchOptions {
    pub limit: usize,
    /// 0 = exact terms, >0 = fuzzy match with this edit distance
    pub edit_distance: u8,
    pub case_sensitive: bool,
    pub use_regex: bool,
    /// Number of context lines returned around the first match; 0 disables snippets
    pub snippet_lines: usize,
    pub languages: Vec<String>,
    pub exclude_languages: Vec<String>,
    pub path_filters: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl Default for FtsSearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            edit_distance: 0,
            case_sensitive: false,
            use_regex: false,
            snippet_lines: 5,
            languages: Vec::new(),
            exclude_languages: Vec::new(),
            path_filters: Vec::new(),
            exclude_paths: Vec::new(),
        }
    }
}

/// One FTS hit with an extracted snippet.
#[derive(Debug, Clone, Serialize)]
pub struct FtsSearchResult {
    pub path: String,
    pub language: String,
    pub score: f32,
    /// 1-based line of the first matching line, when one was found
    pub match_line: Option<usize>,
    pub snippet: Vec<String>,
}

pub struct FtsStore {
    index: Index,
    reader: IndexReader,
    writer: Mutex<Option<IndexWriter>>,
    path_field: Field,
    content_field: Field,
    language_field: Field,
    line_count_field: Field,
}

impl FtsStore {
    /// Open or create the index at `dir`. The writer is lazy-initialized on
    /// first mutation so read-only handles never take the writer lock file.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| CidxError::io(dir, e))?;

        let mut schema_builder = Schema::builder();
        let path_field = schema_builder.add_text_field("path", STRING | STORED);
        let content_field = schema_builder.add_text_field("content", TEXT | STORED);
        let language_field = schema_builder.add_text_field("language", STRING | STORED);
        let line_count_field = schema_builder.add_u64_field(
            "line_count",
            NumericOptions::default().set_indexed().set_stored(),
        );
        let schema = schema_builder.build();

        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir)?
        } else {
            let mmap = MmapDirectory::open(dir)
                .map_err(|e| CidxError::Fts(format!("cannot open {}: {e}", dir.display())))?;
            Index::create(mmap, schema.clone(), IndexSettings::default())?
        };

        let reader = index.reader()?;

        Ok(Self {
            index,
            reader,
            writer: Mutex::new(None),
            path_field,
            content_field,
            language_field,
            line_count_field,
        })
    }

    /// Destroy any existing index at `dir` and open a fresh one.
    pub fn recreate(dir: &Path) -> Result<Self> {
        if dir.exists() {
            std::fs::remove_dir_all(dir).map_err(|e| CidxError::io(dir, e))?;
        }
        Self::open(dir)
    }

    fn with_writer<T>(&self, f: impl FnOnce(&IndexWriter) -> Result<T>) -> Result<T> {
        let mut guard = self.writer.lock().expect("fts writer poisoned");
        if guard.is_none() {
            *guard = Some(self.index.writer(50_000_000)?);
        }
        f(guard.as_ref().expect("writer just initialized"))
    }

    /// Add (or replace) the document for one file.
    pub fn add_file_document(&self, path: &str, content: &str, language: &str) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_term(Term::from_field_text(self.path_field, path));

            let mut doc = TantivyDocument::new();
            doc.add_text(self.path_field, path);
            doc.add_text(self.content_field, content);
            doc.add_text(self.language_field, language);
            doc.add_u64(self.line_count_field, content.lines().count() as u64);
            writer.add_document(doc)?;
            Ok(())
        })
    }

    pub fn delete_by_path(&self, path: &str) -> Result<()> {
        self.with_writer(|writer| {
            writer.delete_term(Term::from_field_text(self.path_field, path));
            Ok(())
        })
    }

    pub fn commit(&self) -> Result<()> {
        let mut guard = self.writer.lock().expect("fts writer poisoned");
        if let Some(writer) = guard.as_mut() {
            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        {
            let mut guard = self.writer.lock().expect("fts writer poisoned");
            if guard.is_none() {
                *guard = Some(self.index.writer(50_000_000)?);
            }
            let writer = guard.as_mut().expect("writer just initialized");
            writer.delete_all_documents()?;
            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(())
    }

    pub fn num_documents(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn search(&self, query_text: &str, options: &FtsSearchOptions) -> Result<Vec<FtsSearchResult>> {
        let searcher = self.reader.searcher();
        let query = self.build_query(query_text, options)?;

        let filters = FilterConditions::build(
            &options.languages,
            &options.exclude_languages,
            &options.path_filters,
            &options.exclude_paths,
        )?;

        // Over-fetch when post-filtering will drop candidates
        let fetch = if filters.is_empty() && !options.case_sensitive {
            options.limit
        } else {
            (options.limit * 4).max(options.limit + 16)
        };

        let top_docs = searcher.search(&query, &TopDocs::with_limit(fetch.max(1)))?;
        debug!("FTS query matched {} candidates", top_docs.len());

        let mut results = Vec::new();
        for (score, address) in top_docs {
            if results.len() >= options.limit {
                break;
            }
            let doc: TantivyDocument = searcher.doc(address)?;

            let path = doc
                .get_first(self.path_field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let content = doc
                .get_first(self.content_field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let language = doc
                .get_first(self.language_field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            // Language and path filters run against the stored fields
            let pseudo = PointPayload {
                path: path.clone(),
                language: language.clone(),
                ..Default::default()
            };
            if !filters.matches(&pseudo) {
                continue;
            }

            if options.case_sensitive
                && !options.use_regex
                && !query_tokens(query_text).iter().all(|t| content.contains(t.as_str()))
            {
                continue;
            }

            let (match_line, snippet) = extract_snippet(&content, query_text, options);
            results.push(FtsSearchResult {
                path,
                language,
                score,
                match_line,
                snippet,
            });
        }

        Ok(results)
    }

    fn build_query(&self, query_text: &str, options: &FtsSearchOptions) -> Result<Box<dyn Query>> {
        if options.use_regex {
            let regex = RegexQuery::from_pattern(query_text, self.content_field)
                .map_err(|e| CidxError::Fts(format!("invalid regex {query_text:?}: {e}")))?;
            return Ok(Box::new(regex));
        }

        if options.edit_distance > 0 {
            let clauses: Vec<(Occur, Box<dyn Query>)> = query_tokens(query_text)
                .into_iter()
                .map(|token| {
                    let term = Term::from_field_text(self.content_field, &token.to_lowercase());
                    let fuzzy = FuzzyTermQuery::new(term, options.edit_distance, true);
                    (Occur::Should, Box::new(fuzzy) as Box<dyn Query>)
                })
                .collect();
            if clauses.is_empty() {
                return Err(CidxError::Fts("empty query".to_string()));
            }
            return Ok(Box::new(BooleanQuery::new(clauses)));
        }

        let parser = QueryParser::for_index(&self.index, vec![self.content_field]);
        match parser.parse_query(query_text) {
            Ok(query) => Ok(query),
            Err(_) => {
                // Strip operators tantivy chokes on and retry as plain terms
                let escaped = query_text.replace(
                    [':', '(', ')', '[', ']', '{', '}', '^', '"', '~', '*', '?', '\\', '/'],
                    " ",
                );
                parser
                    .parse_query(&escaped)
                    .map_err(|e| CidxError::Fts(format!("unparseable query: {e}")))
            }
        }
    }
}

fn query_tokens(query_text: &str) -> Vec<String> {
    query_text
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

/// Locate the first matching line and cut `snippet_lines` lines around it.
fn extract_snippet(
    content: &str,
    query_text: &str,
    options: &FtsSearchOptions,
) -> (Option<usize>, Vec<String>) {
    if options.snippet_lines == 0 {
        return (None, Vec::new());
    }

    let tokens: Vec<String> = if options.case_sensitive {
        query_tokens(query_text)
    } else {
        query_tokens(query_text)
            .into_iter()
            .map(|t| t.to_lowercase())
            .collect()
    };

    let lines: Vec<&str> = content.lines().collect();
    let matched = lines.iter().position(|line| {
        let haystack = if options.case_sensitive {
            line.to_string()
        } else {
            line.to_lowercase()
        };
        tokens.iter().any(|t| haystack.contains(t.as_str()))
    });

    match matched {
        Some(index) => {
            let before = options.snippet_lines / 2;
            let start = index.saturating_sub(before);
            let end = (start + options.snippet_lines).min(lines.len());
            let snippet = lines[start..end].iter().map(|l| l.to_string()).collect();
            (Some(index + 1), snippet)
        }
        None => {
            let end = options.snippet_lines.min(lines.len());
            (None, lines[..end].iter().map(|l| l.to_string()).collect())
        }
    }
}

/// Path of the FTS index directory for a given config directory.
pub fn fts_dir(config_dir: &Path) -> PathBuf {
    config_dir.join(crate::constants::FTS_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_with_docs() -> (tempfile::TempDir, FtsStore) {
        let dir = tempdir().unwrap();
        let store = FtsStore::open(dir.path()).unwrap();
        store
            .add_file_document(
                "src/auth.rs",
                "fn authenticate(user: &User) -> Result<Token> {\n    verify_password(user)\n}",
                "rs",
            )
            .unwrap();
        store
            .add_file_document(
                "src/tests/auth_test.py",
                "def test_authenticate():\n    assert authenticate(user)",
                "py",
            )
            .unwrap();
        store
            .add_file_document(
                "docs/notes.md",
                "# Authentication\nNotes about the token workflow",
                "md",
            )
            .unwrap();
        store.commit().unwrap();
        (dir, store)
    }

    #[test]
    fn test_basic_search_and_snippet() {
        let (_dir, store) = store_with_docs();
        let results = store
            .search("authenticate", &FtsSearchOptions::default())
            .unwrap();
        assert!(!results.is_empty());
        let first = &results[0];
        assert!(first.match_line.is_some());
        assert!(first.snippet.iter().any(|l| l.contains("authenticate")));
    }

    #[test]
    fn test_language_and_path_filters() {
        let (_dir, store) = store_with_docs();
        let options = FtsSearchOptions {
            languages: vec!["python".to_string()],
            ..Default::default()
        };
        let results = store.search("authenticate", &options).unwrap();
        assert!(results.iter().all(|r| r.language == "py"));

        let options = FtsSearchOptions {
            exclude_paths: vec!["*/tests/*".to_string()],
            ..Default::default()
        };
        let results = store.search("authenticate", &options).unwrap();
        assert!(results.iter().all(|r| !r.path.contains("/tests/")));
    }

    #[test]
    fn test_fuzzy_search_tolerates_typo() {
        let (_dir, store) = store_with_docs();
        let options = FtsSearchOptions {
            edit_distance: 1,
            ..Default::default()
        };
        let results = store.search("authentcate", &options).unwrap();
        assert!(!results.is_empty());
    }

    #[test]
    fn test_regex_search() {
        let (_dir, store) = store_with_docs();
        let options = FtsSearchOptions {
            use_regex: true,
            ..Default::default()
        };
        let results = store.search("authent.*", &options).unwrap();
        assert!(!results.is_empty());

        let err = store.search("[invalid", &options);
        assert!(err.is_err());
    }

    #[test]
    fn test_case_sensitive_filtering() {
        let (_dir, store) = store_with_docs();
        let options = FtsSearchOptions {
            case_sensitive: true,
            ..Default::default()
        };
        // Content contains "Authentication" capitalized only in notes.md
        let results = store.search("Authentication", &options).unwrap();
        assert!(results.iter().all(|r| r.path == "docs/notes.md"));
    }

    #[test]
    fn test_replace_and_delete_document() {
        let (_dir, store) = store_with_docs();
        store
            .add_file_document("src/auth.rs", "fn renamed() {}", "rs")
            .unwrap();
        store.commit().unwrap();
        assert_eq!(store.num_documents(), 3);

        store.delete_by_path("src/auth.rs").unwrap();
        store.commit().unwrap();
        assert_eq!(store.num_documents(), 2);
    }

    #[test]
    fn test_recreate_starts_empty() {
        let dir = tempdir().unwrap();
        {
            let store = FtsStore::open(dir.path()).unwrap();
            store.add_file_document("a.rs", "fn a() {}", "rs").unwrap();
            store.commit().unwrap();
            assert_eq!(store.num_documents(), 1);
        }
        let store = FtsStore::recreate(dir.path()).unwrap();
        assert_eq!(store.num_documents(), 0);
    }
}
