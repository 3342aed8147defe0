//! Exact inner-product vector index with a parallel metadata list.
//!
//! [`FlatIndex`] keeps vectors in one row-major buffer and one [`Chunk`]
//! per vector in insertion order, so `metadata[i]` always describes
//! vector `i`. Search is brute force over all rows, which is exact and
//! fast enough for the corpus sizes this service targets.
//!
//! The binary artifact codec ([`FlatIndex::encode_vectors`] /
//! [`FlatIndex::decode_vectors`]) is pure; the app crate owns the files.
//!
//! # Artifact layout
//!
//! ```text
//! magic "RGIX" | version u32 | dim u32 | count u64 | count × dim f32   (all little-endian)
//! ```

use std::cmp::Ordering;

use crate::chunk::Chunk;
use crate::embedding::{dot, EmbeddingMatrix};
use crate::error::{RagError, Result};

const MAGIC: &[u8; 4] = b"RGIX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// One search hit: similarity score and position in the index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub score: f32,
    pub index: usize,
}

/// Flat inner-product index plus metadata, one generation per dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dim: usize,
    vectors: Vec<f32>,
    metadata: Vec<Chunk>,
}

impl FlatIndex {
    /// Empty index of width `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: Vec::new(),
            metadata: Vec::new(),
        }
    }

    /// Rebuild an index from decoded parts, checking that they line up.
    pub fn from_parts(dim: usize, vectors: Vec<f32>, metadata: Vec<Chunk>) -> Result<Self> {
        if dim == 0 || vectors.len() % dim != 0 {
            return Err(RagError::CorruptIndex(format!(
                "{} floats do not divide into rows of {}",
                vectors.len(),
                dim
            )));
        }
        let count = vectors.len() / dim;
        if count != metadata.len() {
            return Err(RagError::CorruptIndex(format!(
                "{} vectors but {} metadata records",
                count,
                metadata.len()
            )));
        }
        Ok(Self {
            dim,
            vectors,
            metadata,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored vectors (always equal to the metadata length).
    pub fn count(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn metadata(&self) -> &[Chunk] {
        &self.metadata
    }

    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.metadata.get(index)
    }

    pub fn vector(&self, index: usize) -> Option<&[f32]> {
        if index >= self.count() {
            return None;
        }
        Some(&self.vectors[index * self.dim..(index + 1) * self.dim])
    }

    /// Append vectors and their metadata in the same order.
    ///
    /// Nothing is mutated unless both checks pass.
    ///
    /// # Errors
    ///
    /// - [`RagError::DimensionMismatch`] when `vectors.dim() != self.dim()`.
    /// - [`RagError::InvalidConfiguration`] when row and record counts differ.
    pub fn add(&mut self, vectors: &EmbeddingMatrix, metadatas: Vec<Chunk>) -> Result<()> {
        if vectors.dim() != self.dim {
            return Err(RagError::DimensionMismatch {
                expected: self.dim,
                actual: vectors.dim(),
            });
        }
        if vectors.rows() != metadatas.len() {
            return Err(RagError::InvalidConfiguration(format!(
                "{} vectors but {} metadata records",
                vectors.rows(),
                metadatas.len()
            )));
        }
        for row in vectors.iter_rows() {
            self.vectors.extend_from_slice(row);
        }
        self.metadata.extend(metadatas);
        Ok(())
    }

    /// Top `min(pool_size, count)` neighbors by inner product, best first.
    ///
    /// Equal scores keep insertion order.
    ///
    /// # Errors
    ///
    /// - [`RagError::NotInitialized`] when the index holds no vectors.
    /// - [`RagError::DimensionMismatch`] when `query` has the wrong width.
    pub fn search(&self, query: &[f32], pool_size: usize) -> Result<Vec<Neighbor>> {
        if self.is_empty() {
            return Err(RagError::NotInitialized);
        }
        if query.len() != self.dim {
            return Err(RagError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }

        let mut hits: Vec<Neighbor> = self
            .vectors
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(index, row)| Neighbor {
                score: dot(query, row),
                index,
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        hits.truncate(pool_size.min(self.count()));
        Ok(hits)
    }

    /// Serialize the vectors into the binary artifact format.
    pub fn encode_vectors(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.vectors.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dim as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.count() as u64).to_le_bytes());
        for &v in &self.vectors {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    /// Read just the dimension from an artifact header.
    pub fn peek_dim(bytes: &[u8]) -> Result<usize> {
        Ok(read_header(bytes)?.0)
    }

    /// Decode an artifact into `(dim, row-major vectors)`.
    pub fn decode_vectors(bytes: &[u8]) -> Result<(usize, Vec<f32>)> {
        let (dim, count) = read_header(bytes)?;
        let body = &bytes[HEADER_LEN..];
        let expected = count
            .checked_mul(dim)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| RagError::CorruptIndex("header sizes overflow".to_string()))?;
        if body.len() != expected {
            return Err(RagError::CorruptIndex(format!(
                "expected {} body bytes, found {}",
                expected,
                body.len()
            )));
        }
        let vectors = body
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok((dim, vectors))
    }
}

fn read_header(bytes: &[u8]) -> Result<(usize, usize)> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(RagError::CorruptIndex("missing RGIX header".to_string()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(RagError::CorruptIndex(format!(
            "unsupported format version {}",
            version
        )));
    }
    let dim = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let mut count = [0u8; 8];
    count.copy_from_slice(&bytes[12..20]);
    Ok((dim, u64::from_le_bytes(count) as usize))
}
