//! Sentence-window text chunker.
//!
//! Splits document text into overlapping windows of sentence units and
//! stamps each resulting [`Chunk`] with its position (`chunk_index`), the
//! total number of chunks (`chunk_count`), and a display marker
//! (`chunk_info`).
//!
//! Sentence detection is deliberately naive: the text is split on the
//! literal delimiter `". "`. Abbreviations, other punctuation, and line
//! breaks are not treated as boundaries. Windows are re-joined with the
//! same delimiter.
//!
//! # Windowing
//!
//! With `n` sentences, window size `w` and overlap `o` (`o < w`), windows
//! start at `0, w-o, 2(w-o), …` and the last window is the first one that
//! reaches sentence `n`. Consecutive windows share `o` sentences.
//!
//! ```text
//! n = 20, w = 15, o = 3
//! [0 ............ 15)
//!              [12 ..... 20)
//! ```
//!
//! Empty text yields exactly one chunk with empty content.

use std::ops::Range;

use crate::error::{RagError, Result};
use crate::models::{Chunk, ChunkMetadata, DocumentMetadata};

/// Delimiter separating sentence units.
pub const SENTENCE_DELIMITER: &str = ". ";

/// Split text into sentence units.
pub fn split_sentences(text: &str) -> Vec<&str> {
    text.split(SENTENCE_DELIMITER).collect()
}

fn validate(window_size: usize, overlap: usize) -> Result<usize> {
    if window_size == 0 {
        return Err(RagError::Validation(
            "chunk window size must be > 0".to_string(),
        ));
    }
    if overlap >= window_size {
        return Err(RagError::Validation(format!(
            "chunk overlap ({}) must be smaller than window size ({})",
            overlap, window_size
        )));
    }
    Ok(window_size - overlap)
}

/// Number of windows needed to cover `num_sentences` units.
///
/// Always at least 1, so empty and short input still produce one chunk.
pub fn chunk_count(num_sentences: usize, window_size: usize, overlap: usize) -> Result<usize> {
    let step = validate(window_size, overlap)?;
    if num_sentences <= window_size {
        return Ok(1);
    }
    Ok(1 + (num_sentences - window_size).div_ceil(step))
}

/// Sentence-index ranges of every window, in order.
pub fn window_ranges(
    num_sentences: usize,
    window_size: usize,
    overlap: usize,
) -> Result<Vec<Range<usize>>> {
    let step = validate(window_size, overlap)?;
    let mut ranges = Vec::with_capacity(chunk_count(num_sentences, window_size, overlap)?);
    let mut start = 0;
    loop {
        let end = (start + window_size).min(num_sentences);
        ranges.push(start..end);
        if end >= num_sentences {
            break;
        }
        start += step;
    }
    Ok(ranges)
}

/// Split `text` into overlapping sentence windows.
///
/// Each chunk's metadata is a fresh copy of `metadata` extended with
/// sequencing fields; `metadata` itself is never modified.
///
/// # Errors
///
/// Returns [`RagError::Validation`] when `window_size == 0` or
/// `overlap >= window_size`.
pub fn chunk_text(
    text: &str,
    metadata: &DocumentMetadata,
    window_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    let sentences = split_sentences(text);
    let ranges = window_ranges(sentences.len(), window_size, overlap)?;
    let count = ranges.len();

    Ok(ranges
        .into_iter()
        .enumerate()
        .map(|(index, range)| Chunk {
            content: sentences[range].join(SENTENCE_DELIMITER),
            metadata: ChunkMetadata::for_chunk(metadata, index, count),
        })
        .collect())
}
