//! Embedding provider trait, the embedding matrix, and the hash backend.
//!
//! Every backend implements [`EmbeddingProvider`]. Callers never use
//! [`EmbeddingProvider::embed_batch`] directly; they go through
//! [`embed_texts`], which cleans the input batch, short-circuits empty
//! batches to a 1×1 zero sentinel, and L2-normalizes every row so inner
//! product equals cosine similarity.
//!
//! Network and local-model backends live in the `ragchat` app crate.
//! [`HashEmbedder`] lives here because it is pure and deterministic.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

/// Dimension of the default hash backend.
pub const DEFAULT_HASH_DIM: usize = 32;

/// Added to each row norm before dividing, so zero rows stay finite.
const NORM_EPSILON: f32 = 1e-12;

/// Trait for embedding backends.
///
/// `embed_batch` receives a non-empty batch of trimmed, non-empty strings
/// and returns one row per input, in order. Rows need not be normalized.
/// Backends that call a remote service must map transport failures to
/// [`RagError::Embedding`] and must not retry internally.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a cleaned batch.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Row-major `(rows, dim)` matrix of `f32` embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    data: Vec<f32>,
    rows: usize,
    dim: usize,
}

impl EmbeddingMatrix {
    /// Build a matrix from row vectors. All rows must share one width.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let dim = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * dim);
        for row in &rows {
            if row.len() != dim {
                return Err(RagError::DimensionMismatch {
                    expected: dim,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            data,
            rows: rows.len(),
            dim,
        })
    }

    /// The 1×1 zero matrix returned for an empty batch.
    pub fn sentinel() -> Self {
        Self {
            data: vec![0.0],
            rows: 1,
            dim: 1,
        }
    }

    /// True for the "nothing to embed" result.
    pub fn is_sentinel(&self) -> bool {
        self.rows == 1 && self.dim == 1 && self.data[0] == 0.0
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Borrow row `i`.
    ///
    /// # Panics
    ///
    /// If `i >= self.rows()`.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact panics on 0; a zero-width matrix has no rows to yield.
        self.data.chunks_exact(self.dim.max(1)).take(self.rows)
    }

    fn normalize_rows(&mut self) {
        if self.dim == 0 {
            return;
        }
        for row in self.data.chunks_exact_mut(self.dim) {
            let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt() + NORM_EPSILON;
            for x in row.iter_mut() {
                *x /= norm;
            }
        }
    }
}

/// Trim every entry and drop the empty ones.
///
/// Optional inputs are handled at the call site with `.flatten()`.
pub fn normalize_texts<I, S>(texts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    texts
        .into_iter()
        .map(|t| t.as_ref().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Embed a batch of texts and L2-normalize each row.
///
/// Returns [`EmbeddingMatrix::sentinel`] when nothing survives
/// [`normalize_texts`]; the backend is not called in that case.
pub async fn embed_texts<S: AsRef<str>>(
    provider: &dyn EmbeddingProvider,
    texts: &[S],
) -> Result<EmbeddingMatrix> {
    let cleaned = normalize_texts(texts);
    if cleaned.is_empty() {
        return Ok(EmbeddingMatrix::sentinel());
    }

    let rows = provider.embed_batch(&cleaned).await?;
    if rows.len() != cleaned.len() {
        return Err(RagError::Embedding(format!(
            "backend returned {} vectors for {} inputs",
            rows.len(),
            cleaned.len()
        )));
    }

    let mut matrix = EmbeddingMatrix::from_rows(rows)?;
    matrix.normalize_rows();
    Ok(matrix)
}

/// Embed a single string as a one-element batch.
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Result<EmbeddingMatrix> {
    embed_texts(provider, &[text]).await
}

/// Inner product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// ============ Hash backend ============

/// Deterministic bag-of-tokens hash embedding.
///
/// Lowercases, splits on whitespace, hashes each token with SHA-256, and
/// adds 1.0 to bucket `u32_le(hash[..4]) % dim`. Not semantically strong,
/// but needs no network or model files.
pub struct HashEmbedder {
    dim: usize,
    name: String,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        let dim = dim.max(1);
        Self {
            dim,
            name: format!("dummy-{}-hash", dim),
        }
    }

    /// Hash a single text into an (unnormalized) bucket vector.
    pub fn hash_vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
                % self.dim;
            v[bucket] += 1.0;
        }
        v
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIM)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.hash_vector(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn norm(row: &[f32]) -> f32 {
        row.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[tokio::test]
    async fn test_empty_batch_returns_sentinel_without_calling_backend() {
        let p = CountingProvider {
            calls: AtomicUsize::new(0),
        };
        let m = embed_texts(&p, &["", "   ", "\n"]).await.unwrap();
        assert!(m.is_sentinel());
        assert_eq!((m.rows(), m.dim()), (1, 1));
        assert_eq!(p.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rows_are_unit_norm() {
        let p = HashEmbedder::default();
        let m = embed_texts(&p, &["HR leave policy", "security  incident", " x "])
            .await
            .unwrap();
        assert_eq!(m.rows(), 3);
        assert_eq!(m.dim(), DEFAULT_HASH_DIM);
        for row in m.iter_rows() {
            assert!((norm(row) - 1.0).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_blank_entries_dropped() {
        let p = CountingProvider {
            calls: AtomicUsize::new(0),
        };
        let m = embed_texts(&p, &["a", "  ", "bbb"]).await.unwrap();
        assert_eq!(m.rows(), 2);
    }

    #[tokio::test]
    async fn test_embed_one_is_single_row() {
        let p = HashEmbedder::new(8);
        let m = embed_one(&p, "hello world").await.unwrap();
        assert_eq!((m.rows(), m.dim()), (1, 8));
    }

    #[test]
    fn test_hash_is_deterministic_and_case_insensitive() {
        let p = HashEmbedder::default();
        assert_eq!(p.hash_vector("Leave Policy"), p.hash_vector("leave policy"));
        assert_eq!(p.hash_vector("a b c").iter().sum::<f32>(), 3.0);
        assert_eq!(p.model_name(), "dummy-32-hash");
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        let err = EmbeddingMatrix::from_rows(vec![vec![1.0, 2.0], vec![1.0]]).unwrap_err();
        assert_eq!(
            err,
            RagError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_dot() {
        assert_eq!(dot(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
    }
}
