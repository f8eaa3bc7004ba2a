//! Fixed-window overlapping text chunker.
//!
//! Splits extracted text into windows of `window` characters that overlap
//! by `overlap` characters, recording the character offsets of each window
//! in the source text. When a hard cut would land mid-word, the boundary
//! backs up to the nearest preceding whitespace within a small lookback
//! distance.
//!
//! Chunking is pure and deterministic: identical input always yields an
//! identical chunk sequence, which is what makes reprocessing idempotent.

/// How far (in chars) a boundary may back up to find whitespace before
/// accepting a hard mid-word cut.
const BOUNDARY_LOOKBACK: usize = 80;

/// One window over the source text. Offsets are character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSlice {
    pub index: i64,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Split `text` into overlapping windows.
///
/// Windows advance by `window - overlap` characters; the final chunk is
/// shorter when the remaining text is smaller than a full window. Text
/// shorter than one window yields exactly one chunk. Empty text yields no
/// chunks (callers reject empty extractions before chunking).
pub fn chunk_text(text: &str, window: usize, overlap: usize) -> Vec<ChunkSlice> {
    assert!(window > 0, "window must be > 0");
    let overlap = overlap.min(window - 1);

    // Char-indexed view: byte offset of every char, plus one-past-the-end.
    let mut byte_at: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
    byte_at.push(text.len());
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();

    if n == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let hard_end = (start + window).min(n);
        let end = if hard_end < n {
            soft_boundary(&chars, start, hard_end)
        } else {
            n
        };

        chunks.push(ChunkSlice {
            index: chunks.len() as i64,
            start,
            end,
            text: text[byte_at[start]..byte_at[end]].to_string(),
        });

        if end >= n {
            break;
        }
        // Guarantee forward progress even when a soft cut shrinks the window
        // below the overlap.
        start = if end > start + overlap { end - overlap } else { end };
    }

    chunks
}

/// Prefer the nearest preceding whitespace when `hard_end` would split a
/// word. Returns the (exclusive) end offset to cut at.
fn soft_boundary(chars: &[char], start: usize, hard_end: usize) -> usize {
    let splits_word = !chars[hard_end].is_whitespace() && !chars[hard_end - 1].is_whitespace();
    if !splits_word {
        return hard_end;
    }

    let floor = hard_end.saturating_sub(BOUNDARY_LOOKBACK).max(start + 1);
    for j in (floor..hard_end).rev() {
        if chars[j].is_whitespace() {
            return j + 1;
        }
    }
    hard_end
}
