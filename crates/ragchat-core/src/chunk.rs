//! Fixed-size overlapping text chunker.
//!
//! Splits document text into windows of `size` characters, each starting
//! `size - overlap` characters after the previous one. Internal whitespace
//! runs are collapsed to single spaces first, so all offsets refer to the
//! normalized text.
//!
//! # Algorithm
//!
//! 1. Collapse whitespace runs; empty results yield no chunks.
//! 2. Take `text[start..min(n, start + size)]`.
//! 3. Stop as soon as a window reaches the end of the text.
//! 4. Otherwise advance `start` by the stride and repeat.
//!
//! Advancing by the full stride (rather than stepping back from the window
//! end) guarantees forward progress for every input length.
//!
//! # Example
//!
//! ```rust
//! use ragchat_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("abcdefghij", 4, 1).unwrap();
//! assert_eq!(chunks, vec!["abcd", "defg", "ghij"]);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// Default window size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 350;

/// Default overlap between consecutive windows, in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 60;

/// One retrievable unit of a document. Stored as the metadata record
/// parallel to each vector in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: String,
    pub chunk_id: String,
    pub department: String,
    pub text: String,
}

/// Deterministic chunk identifier: `"{doc_id}::chunk{index}"`.
pub fn chunk_id(doc_id: &str, index: usize) -> String {
    format!("{}::chunk{}", doc_id, index)
}

/// Split `text` into overlapping windows.
///
/// # Errors
///
/// [`RagError::InvalidConfiguration`] when `size == 0` or `overlap >= size`.
///
/// # Guarantees
///
/// - Terminates for every input; at most `ceil(n / (size - overlap))` chunks.
/// - Every window has `size` characters except possibly the last.
/// - Whitespace-only input yields an empty vector.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Result<Vec<String>> {
    validate(size, overlap)?;

    let normalized: Vec<char> = normalize_whitespace(text).chars().collect();
    let n = normalized.len();
    let stride = size - overlap;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < n {
        let end = n.min(start + size);
        chunks.push(normalized[start..end].iter().collect());
        if end == n {
            break;
        }
        start += stride;
    }
    Ok(chunks)
}

/// Chunk a whole document into [`Chunk`] records with deterministic ids.
pub fn chunk_document(
    doc_id: &str,
    department: &str,
    text: &str,
    size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    Ok(chunk_text(text, size, overlap)?
        .into_iter()
        .enumerate()
        .map(|(i, text)| Chunk {
            doc_id: doc_id.to_string(),
            chunk_id: chunk_id(doc_id, i),
            department: department.to_string(),
            text,
        })
        .collect())
}

/// Check chunker parameters without chunking anything.
pub fn validate(size: usize, overlap: usize) -> Result<()> {
    if size == 0 {
        return Err(RagError::InvalidConfiguration(
            "chunk size must be > 0".to_string(),
        ));
    }
    if overlap >= size {
        return Err(RagError::InvalidConfiguration(format!(
            "chunk overlap ({}) must be smaller than size ({})",
            overlap, size
        )));
    }
    Ok(())
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rebuild the normalized text from the non-overlapping part of each chunk.
    fn stitch(chunks: &[String], overlap: usize) -> String {
        let mut out = String::new();
        for (i, c) in chunks.iter().enumerate() {
            if i == 0 {
                out.push_str(c);
            } else {
                out.extend(c.chars().skip(overlap));
            }
        }
        out
    }

    #[test]
    fn test_rejects_zero_size() {
        assert!(matches!(
            chunk_text("abc", 0, 0),
            Err(RagError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_size() {
        assert!(matches!(
            chunk_text("abc", 5, 5),
            Err(RagError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            chunk_text("abc", 5, 9),
            Err(RagError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert!(chunk_text("", 10, 2).unwrap().is_empty());
        assert!(chunk_text("  \n\t  ", 10, 2).unwrap().is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        // Input shorter than size used to stall the step-back loop.
        let chunks = chunk_text("hello", 350, 60).unwrap();
        assert_eq!(chunks, vec!["hello"]);
    }

    #[test]
    fn test_whitespace_normalized_before_windowing() {
        let chunks = chunk_text("a  b\n\nc\td", 100, 0).unwrap();
        assert_eq!(chunks, vec!["a b c d"]);
    }

    #[test]
    fn test_windows_and_overlap() {
        let chunks = chunk_text("abcdefghij", 4, 1).unwrap();
        assert_eq!(chunks, vec!["abcd", "defg", "ghij"]);

        let chunks = chunk_text("abcdefghijk", 4, 1).unwrap();
        assert_eq!(chunks, vec!["abcd", "defg", "ghij", "jk"]);
    }

    #[test]
    fn test_progress_bound_and_coverage() {
        let text: String = (0..257).map(|i| format!("w{} ", i % 13)).collect();
        let normalized = normalize_whitespace(&text);
        let n = normalized.chars().count();

        for size in 1..40 {
            for overlap in 0..size {
                let chunks = chunk_text(&text, size, overlap).unwrap();
                let stride = size - overlap;
                assert!(
                    chunks.len() <= n.div_ceil(stride),
                    "size={} overlap={} produced {} chunks",
                    size,
                    overlap,
                    chunks.len()
                );
                assert_eq!(stitch(&chunks, overlap), normalized);
            }
        }
    }

    #[test]
    fn test_multibyte_chars_counted_as_chars() {
        let chunks = chunk_text("┌──┐ │é│ └──┘", 4, 0).unwrap();
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
        assert_eq!(chunks.concat(), "┌──┐ │é│ └──┘");
    }

    #[test]
    fn test_chunk_document_ids() {
        let chunks = chunk_document("HR-1", "HR", "abcdefghij", 4, 1).unwrap();
        let ids: Vec<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["HR-1::chunk0", "HR-1::chunk1", "HR-1::chunk2"]);
        assert!(chunks.iter().all(|c| c.department == "HR" && c.doc_id == "HR-1"));
    }
}
