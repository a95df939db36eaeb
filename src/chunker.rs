//! Deterministic Markdown chunker.
//!
//! Splits UTF-8 Markdown into overlapping chunks of approximately
//! `chunking.tokens` tokens, where a token is estimated as 4 UTF-8 bytes
//! (the same unit the embedding batcher uses). Chunk boundaries fall on
//! line boundaries so every chunk carries an exact 1-based inclusive
//! `start_line..end_line` range back into the source file.
//!
//! The same input and configuration always reproduce the same split.
//! Whitespace-only chunks are dropped, and any chunk longer than the
//! active provider's per-input limit is clipped at a char boundary.
//!
//! Session transcripts are chunked over a rendered plain-text form; the
//! renderer's line map is applied afterwards via [`map_lines`] so line
//! ranges point at real transcript lines.

use sha2::{Digest, Sha256};

use crate::config::ChunkingSettings;

/// Estimated bytes per token. Shared by the chunker and the batcher.
pub const BYTES_PER_TOKEN: usize = 4;

/// One indexable unit of text with provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    /// SHA-256 of `text`, lowercase hex.
    pub hash: String,
}

/// Estimate the token count of a string: UTF-8 bytes / 4, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(BYTES_PER_TOKEN)
}

/// SHA-256 lowercase hex digest of a string.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Derive a chunk's store id from its identifying tuple. Re-deriving
/// from the same file content always produces the same id.
pub fn chunk_id(
    source: &str,
    path: &str,
    start_line: usize,
    end_line: usize,
    chunk_hash: &str,
    model: &str,
) -> String {
    hash_text(&format!(
        "{source}:{path}:{start_line}:{end_line}:{chunk_hash}:{model}"
    ))
}

/// Split text into overlapping line-aligned chunks.
///
/// `max_input_tokens` is the provider's per-input limit; chunks past it
/// are clipped. Empty or whitespace-only input yields no chunks.
pub fn chunk_markdown(
    text: &str,
    chunking: &ChunkingSettings,
    max_input_tokens: usize,
) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let budget = chunking.tokens.max(1);
    let overlap = chunking.overlap.min(budget.saturating_sub(1));
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < lines.len() {
        let mut end = start;
        let mut tokens = 0usize;
        while end < lines.len() {
            let line_tokens = estimate_tokens(lines[end]).max(1);
            if end > start && tokens + line_tokens > budget {
                break;
            }
            tokens += line_tokens;
            end += 1;
        }

        let body = lines[start..end].join("\n");
        if !body.trim().is_empty() {
            let clipped = clip_to_tokens(&body, max_input_tokens);
            chunks.push(Chunk {
                hash: hash_text(&clipped),
                text: clipped,
                start_line: start + 1,
                end_line: end,
            });
        }

        if end >= lines.len() {
            break;
        }

        // Walk back from the boundary until the overlap budget is spent,
        // but always advance by at least one line.
        let mut next = end;
        let mut overlap_tokens = 0usize;
        while next > start + 1 && overlap_tokens < overlap {
            overlap_tokens += estimate_tokens(lines[next - 1]).max(1);
            next -= 1;
        }
        start = next.max(start + 1);
    }

    chunks
}

/// Truncate `text` to at most `max_tokens` worth of bytes, on a char
/// boundary, trimming any ragged trailing whitespace.
pub fn clip_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_bytes = max_tokens.saturating_mul(BYTES_PER_TOKEN);
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].trim_end().to_string()
}

/// Translate chunk line numbers through a renderer's line map.
///
/// `line_map[i]` is the source line (1-based) that produced rendered line
/// `i + 1`. Lines past the map keep their rendered numbers.
pub fn map_lines(chunks: &mut [Chunk], line_map: &[usize]) {
    for chunk in chunks {
        if let Some(&mapped) = line_map.get(chunk.start_line.saturating_sub(1)) {
            chunk.start_line = mapped;
        }
        if let Some(&mapped) = line_map.get(chunk.end_line.saturating_sub(1)) {
            chunk.end_line = mapped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(tokens: usize, overlap: usize) -> ChunkingSettings {
        ChunkingSettings { tokens, overlap }
    }

    #[test]
    fn empty_input_no_chunks() {
        assert!(chunk_markdown("", &settings(100, 10), 8000).is_empty());
        assert!(chunk_markdown("\n\n  \n", &settings(100, 10), 8000).is_empty());
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_markdown("alpha\n", &settings(400, 80), 8000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "alpha");
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 1);
    }

    #[test]
    fn line_ranges_cover_input() {
        let text = (1..=40)
            .map(|i| format!("line number {i} with some padding text"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_markdown(&text, &settings(30, 5), 8000);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks.last().unwrap().end_line, 40);
        for pair in chunks.windows(2) {
            // Overlap pulls the next start at or before the previous end,
            // and never backwards past the previous start.
            assert!(pair[1].start_line <= pair[0].end_line + 1);
            assert!(pair[1].start_line > pair[0].start_line);
        }
    }

    #[test]
    fn deterministic_split() {
        let text = "# Title\n\nSome paragraph with words.\n\n- item one\n- item two\n";
        let a = chunk_markdown(text, &settings(8, 2), 8000);
        let b = chunk_markdown(text, &settings(8, 2), 8000);
        assert_eq!(a, b);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.hash, y.hash);
        }
    }

    #[test]
    fn oversized_line_is_clipped() {
        let long = "x".repeat(1000);
        let chunks = chunk_markdown(&long, &settings(10, 2), 50);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.len() <= 50 * BYTES_PER_TOKEN);
    }

    #[test]
    fn clip_respects_char_boundaries() {
        let text = "é".repeat(100); // 2 bytes each
        let clipped = clip_to_tokens(&text, 10); // 40-byte budget
        assert!(clipped.len() <= 40);
        assert!(clipped.chars().all(|c| c == 'é'));
    }

    #[test]
    fn chunk_id_is_deterministic_and_tuple_sensitive() {
        let a = chunk_id("memory", "memory/a.md", 1, 10, "abc", "m1");
        let b = chunk_id("memory", "memory/a.md", 1, 10, "abc", "m1");
        let c = chunk_id("memory", "memory/a.md", 1, 10, "abc", "m2");
        let d = chunk_id("sessions", "memory/a.md", 1, 10, "abc", "m1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn line_map_translation() {
        let mut chunks = vec![Chunk {
            text: "x".into(),
            start_line: 1,
            end_line: 3,
            hash: hash_text("x"),
        }];
        // Rendered lines 1..=3 came from transcript lines 4, 9, 17.
        map_lines(&mut chunks, &[4, 9, 17]);
        assert_eq!(chunks[0].start_line, 4);
        assert_eq!(chunks[0].end_line, 17);
    }
}
