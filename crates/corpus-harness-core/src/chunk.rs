//! Paragraph-boundary text chunker with overlap.
//!
//! Splits refined document text into [`Chunk`]s bounded by a token budget.
//! Splitting prefers paragraph boundaries (`\n\n`); oversized paragraphs are
//! hard-split at the nearest newline or space. Every chunk after the first
//! is prefixed with the tail of its predecessor so context that straddles a
//! boundary is present in both chunks.
//!
//! # Sizing
//!
//! Tokens are approximated as 4 characters. With `max_tokens = 700` and
//! `overlap_tokens = 80`, each chunk body holds at most 2480 bytes of new text
//! plus up to 320 bytes carried over from the previous chunk, so no chunk
//! exceeds `max_tokens × 4` bytes (plus one joining space).
//!
//! # Example
//!
//! ```rust
//! use corpus_harness_core::chunk::{chunk_text, ChunkingPolicy};
//!
//! let policy = ChunkingPolicy { max_tokens: 700, overlap_tokens: 80 };
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", &policy);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! ```

use uuid::Uuid;

use crate::fingerprint::fingerprint_text;
use crate::models::Chunk;

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Chunk sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingPolicy {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            max_tokens: 700,
            overlap_tokens: 80,
        }
    }
}

impl ChunkingPolicy {
    fn max_chars(&self) -> usize {
        (self.max_tokens * CHARS_PER_TOKEN).max(1)
    }

    /// Overlap never takes more than half of a chunk.
    fn overlap_chars(&self) -> usize {
        (self.overlap_tokens * CHARS_PER_TOKEN).min(self.max_chars() / 2)
    }
}

/// Split `text` into ordered chunks for `document_id`.
///
/// # Guarantees
///
/// - Empty or whitespace-only text yields no chunks.
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
/// - Output is deterministic apart from chunk UUIDs: the same text always
///   yields the same chunk texts and hashes.
/// - Every chunk is valid UTF-8; splits never land inside a code point.
pub fn chunk_text(document_id: &str, text: &str, policy: &ChunkingPolicy) -> Vec<Chunk> {
    let overlap = policy.overlap_chars();
    let body_budget = policy.max_chars() - overlap;

    let bodies = split_bodies(text, body_budget.max(1));
    let mut chunks = Vec::with_capacity(bodies.len());
    let mut previous: Option<&str> = None;

    for (index, body) in bodies.iter().enumerate() {
        let text = match previous {
            Some(prev) if overlap > 0 => {
                let carried = tail_at_word(prev, overlap);
                if carried.is_empty() {
                    body.clone()
                } else {
                    format!("{} {}", carried, body)
                }
            }
            _ => body.clone(),
        };
        chunks.push(make_chunk(document_id, index as i64, &text));
        previous = Some(body);
    }

    chunks
}

/// Pack paragraphs into bodies of at most `budget` bytes.
fn split_bodies(text: &str, budget: usize) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let joined_len = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if joined_len > budget && !buf.is_empty() {
            bodies.push(std::mem::take(&mut buf));
        }

        if para.len() > budget {
            hard_split(para, budget, &mut bodies);
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }

    if !buf.is_empty() {
        bodies.push(buf);
    }
    bodies
}

/// Split one oversized paragraph at newline/space boundaries.
fn hard_split(para: &str, budget: usize, out: &mut Vec<String>) {
    let mut rest = para;
    while !rest.is_empty() {
        if rest.len() <= budget {
            out.push(rest.to_string());
            break;
        }
        let limit = floor_char_boundary(rest, budget);
        let cut = rest[..limit]
            .rfind(['\n', ' '])
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        let cut = if cut == 0 { next_char_boundary(rest) } else { cut };

        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = rest[cut..].trim_start();
    }
}

/// The last `max` bytes of `s`, starting after a whitespace so the carried
/// text begins on a word.
fn tail_at_word(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let start = ceil_char_boundary(s, s.len() - max);
    let tail = &s[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start(),
        None => tail,
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn next_char_boundary(s: &str) -> usize {
    s.char_indices().nth(1).map(|(i, _)| i).unwrap_or(s.len())
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: fingerprint_text(text),
        embedding: Vec::new(),
    }
}
