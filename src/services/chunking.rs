// src/services/chunking.rs

//! Splits extracted source text into the slices fed to the generator, and prices a
//! document in tokens. Positions are counted in chars, so multibyte text never splits
//! inside a code point.

use serde::{Deserialize, Serialize};

use crate::config::{FIRST_CHUNK_CHARS, NEXT_CHUNK_CHARS, PASSES_PER_TOKEN};

/// Continuation state carried from one pipeline job to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkIterator {
    /// Char offset where the next chunk starts.
    pub last_index: usize,
    /// Tail of the previous chunk, prepended for continuity.
    #[serde(default)]
    pub incomplete_chunk: String,
}

/// One slice of work for the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Carried-over context followed by the new text.
    pub text: String,
    /// Char offset of the first new char.
    pub start: usize,
    /// Char offset right after the slice; where the following chunk starts.
    pub end: usize,
    pub has_more: bool,
}

/// Tokens needed to generate questions for a document of `source_len` chars.
/// The first pass covers `FIRST_CHUNK_CHARS`, every later pass `NEXT_CHUNK_CHARS`,
/// and one token pays for `PASSES_PER_TOKEN` passes.
pub fn calculate_required_tokens(source_len: usize) -> i32 {
    let remaining = source_len
        .saturating_sub(FIRST_CHUNK_CHARS)
        .div_ceil(NEXT_CHUNK_CHARS);

    (remaining / PASSES_PER_TOKEN) as i32 + 1
}

/// Cuts the chunk that follows `iterator` (or the first chunk when there is none).
pub fn next_chunk(source: &str, iterator: Option<&ChunkIterator>) -> Chunk {
    let total = source.chars().count();

    let (start, size, context) = match iterator {
        None => (0, FIRST_CHUNK_CHARS, ""),
        Some(it) => (it.last_index, NEXT_CHUNK_CHARS, it.incomplete_chunk.as_str()),
    };

    let body: String = source.chars().skip(start).take(size).collect();
    let end = start.saturating_add(size);

    let mut text = String::with_capacity(context.len() + body.len());
    text.push_str(context);
    text.push_str(&body);

    Chunk {
        text,
        start,
        end,
        has_more: total > end,
    }
}
