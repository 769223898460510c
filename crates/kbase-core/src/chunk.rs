//! Paragraph-boundary text chunker.
//!
//! Splits extracted text into [`DocumentChunk`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! to preserve semantic coherence within each chunk; every chunk records
//! the byte offset of its first character in the extracted text.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Split text on `\n\n` paragraph boundaries.
//! 3. Accumulate paragraphs into a buffer until adding the next paragraph
//!    would exceed `max_chars`.
//! 4. When exceeded, flush the buffer as a chunk and start a new one.
//! 5. If a single paragraph exceeds `max_chars`, perform a hard split at
//!    the nearest newline or space boundary.
//!
//! Text with no non-whitespace content yields no chunks.
//!
//! # Example
//!
//! ```rust
//! use kbase_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("/notes/a.md", "Hello world.\n\nSecond paragraph.", 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].offset, Some(0));
//! ```

use sha2::{Digest, Sha256};

use crate::models::DocumentChunk;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
pub fn chunk_text(source: &str, text: &str, max_tokens: usize) -> Vec<DocumentChunk> {
    let mut chunks = Vec::new();
    split_into(&mut chunks, source, text, 0, None, max_tokens);
    chunks
}

/// Chunk page-delimited text (one entry per page, 1-based page numbers).
/// Offsets are relative to the pages joined with a single form feed.
pub fn chunk_pages<S: AsRef<str>>(source: &str, pages: &[S], max_tokens: usize) -> Vec<DocumentChunk> {
    let mut chunks = Vec::new();
    let mut base = 0;
    for (i, page) in pages.iter().enumerate() {
        let page = page.as_ref();
        split_into(&mut chunks, source, page, base, Some(i as u32 + 1), max_tokens);
        base += page.len() + 1;
    }
    chunks
}

/// SHA-256 over chunk texts; identifies unchanged content across rebuilds.
pub fn content_hash(chunks: &[DocumentChunk]) -> String {
    let mut hasher = Sha256::new();
    for c in chunks {
        hasher.update(c.text.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Leading characters of the first chunk, for catalog previews.
pub fn preview(chunks: &[DocumentChunk], max_chars: usize) -> String {
    let Some(first) = chunks.first() else {
        return String::new();
    };
    let collapsed = first.text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &collapsed[..idx]),
        None => collapsed,
    }
}

fn split_into(
    out: &mut Vec<DocumentChunk>,
    source: &str,
    text: &str,
    base: usize,
    page: Option<u32>,
    max_tokens: usize,
) {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let push = |out: &mut Vec<DocumentChunk>, body: &str, offset: usize| {
        out.push(DocumentChunk {
            text: body.to_string(),
            source: source.to_string(),
            page,
            offset: Some(base + offset),
        });
    };

    let mut current_buf = String::new();
    let mut buf_offset = 0;
    let mut pos = 0;

    for para in text.split("\n\n") {
        let para_start = pos;
        pos += para.len() + 2;
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        let trimmed_start = para_start + (para.len() - para.trim_start().len());

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            push(out, &current_buf, buf_offset);
            current_buf.clear();
        }

        if trimmed.len() > max_chars {
            let mut remaining = trimmed;
            let mut consumed = 0;
            while !remaining.is_empty() {
                let split_at = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
                let split_at = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|p| p + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let split_at = if split_at == 0 {
                    remaining
                        .char_indices()
                        .nth(1)
                        .map(|(i, _)| i)
                        .unwrap_or(remaining.len())
                } else {
                    split_at
                };
                let piece = &remaining[..split_at];
                let body = piece.trim();
                if !body.is_empty() {
                    let lead = piece.len() - piece.trim_start().len();
                    push(out, body, trimmed_start + consumed + lead);
                }
                consumed += split_at;
                remaining = &remaining[split_at..];
            }
        } else {
            if current_buf.is_empty() {
                buf_offset = trimmed_start;
            } else {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        push(out, &current_buf, buf_offset);
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("a", "Hello, world!", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].source, "a");
        assert_eq!(chunks[0].page, None);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(chunk_text("a", "", 700).is_empty());
        assert!(chunk_text("a", " \n\n \t", 700).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text("a", text, 700);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn test_offsets_point_at_chunk_start() {
        let text = "  This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let chunks = chunk_text("a", text, 5);
        assert!(chunks.len() > 1);
        for c in &chunks {
            let off = c.offset.unwrap();
            assert!(text[off..].starts_with(&c.text[..c.text.len().min(8)]));
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = chunk_text("a", text, 3);
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.is_empty());
            assert!(text.is_char_boundary(c.offset.unwrap()));
        }
    }

    #[test]
    fn test_pages_are_numbered() {
        let chunks = chunk_pages("r.pdf", &["Page one text.", "", "Page three text."], 700);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page, Some(1));
        assert_eq!(chunks[1].page, Some(3));
        assert_eq!(chunks[1].offset, Some("Page one text.".len() + 2));
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let a = chunk_text("a", text, 2);
        let b = chunk_text("a", text, 2);
        assert_eq!(content_hash(&a), content_hash(&b));
        let c = chunk_text("a", "Alpha\n\nBeta", 2);
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn test_preview_truncates() {
        let chunks = chunk_text("a", "one   two\nthree four", 700);
        assert_eq!(preview(&chunks, 100), "one two three four");
        assert_eq!(preview(&chunks, 3), "one…");
        assert_eq!(preview(&[], 3), "");
    }
}
