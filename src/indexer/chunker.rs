//! Line-window text chunker.
//!
//! Splits file contents into overlapping line windows with 1-based line
//! ranges. Deliberately format-agnostic: the search payload carries the
//! language tag, the chunk boundaries only need to be stable.

/// Maximum lines per chunk
const MAX_CHUNK_LINES: usize = 80;

/// Lines of overlap between consecutive chunks
const CHUNK_OVERLAP_LINES: usize = 10;

#[derive(Debug, Clone)]
pub struct TextChunk {
    pub content: String,
    /// 1-based inclusive
    pub line_start: usize,
    /// 1-based inclusive
    pub line_end: usize,
}

/// Chunk a file's content into line windows. Blank-only windows are
/// dropped; the last window may be shorter.
pub fn chunk_content(content: &str) -> Vec<TextChunk> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let step = MAX_CHUNK_LINES - CHUNK_OVERLAP_LINES;
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < lines.len() {
        let end = (start + MAX_CHUNK_LINES).min(lines.len());
        let window = &lines[start..end];

        if window.iter().any(|l| !l.trim().is_empty()) {
            chunks.push(TextChunk {
                content: window.join("\n"),
                line_start: start + 1,
                line_end: end,
            });
        }

        if end == lines.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Language tag derived from a file extension.
pub fn language_from_extension(path: &std::path::Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_short_file_is_one_chunk() {
        let content = "fn main() {\n    println!(\"hi\");\n}";
        let chunks = chunk_content(content);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].line_start, 1);
        assert_eq!(chunks[0].line_end, 3);
        assert_eq!(chunks[0].content, content);
    }

    #[test]
    fn test_long_file_overlaps() {
        let content: String = (1..=200)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_content(&content);

        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].line_start, 1);
        assert_eq!(chunks[0].line_end, 80);
        // Second window starts before the first ends
        assert_eq!(chunks[1].line_start, 71);
        // Last window reaches the end of the file
        assert_eq!(chunks.last().unwrap().line_end, 200);
    }

    #[test]
    fn test_empty_and_blank_content() {
        assert!(chunk_content("").is_empty());
        assert!(chunk_content("\n\n   \n").is_empty());
    }

    #[test]
    fn test_language_from_extension() {
        assert_eq!(
            language_from_extension(std::path::Path::new("src/main.rs")),
            "rs"
        );
        assert_eq!(
            language_from_extension(std::path::Path::new("Makefile")),
            "unknown"
        );
    }
}
