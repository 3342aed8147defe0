//! Persisted vector store: a [`FlatIndex`] plus its two on-disk artifacts.
//!
//! ```text
//! <store.dir>/rag_index.bin   RGIX header + little-endian f32 vectors
//! <store.dir>/rag_meta.json   [{doc_id, chunk_id, department, text}, ...]
//! ```
//!
//! The pair is one dimension-tagged unit. [`VectorStore::load_or_init`]
//! discards it whenever it cannot be trusted: a different dimension than
//! the active embedding backend, a vector/metadata count mismatch, or an
//! undecodable file. Discarding starts an empty store; it never errors.
//!
//! [`VectorStore::save`] writes both files to temporary siblings and then
//! renames them, index first. A crash between the two renames leaves a
//! pair whose counts disagree, which the next load discards.

use std::path::{Path, PathBuf};

use ragchat_core::chunk::Chunk;
use ragchat_core::embedding::EmbeddingMatrix;
use ragchat_core::index::{FlatIndex, Neighbor};
use ragchat_core::RagError;
use thiserror::Error;

pub const INDEX_FILE: &str = "rag_index.bin";
pub const META_FILE: &str = "rag_meta.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Rag(#[from] RagError),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store metadata error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, StoreError::Rag(RagError::NotInitialized))
    }
}

/// Outcome of [`VectorStore::load_or_init`], mostly for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The in-memory index already had this dimension.
    AlreadyLoaded,
    /// Artifacts were read from disk.
    Loaded { count: usize },
    /// Nothing on disk; started empty.
    Fresh,
    /// Artifacts existed but were discarded.
    Discarded,
}

#[derive(Debug)]
pub struct VectorStore {
    dir: PathBuf,
    index: Option<FlatIndex>,
}

impl VectorStore {
    /// An uninitialized store rooted at `dir`. Nothing is read yet.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            index: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_initialized(&self) -> bool {
        self.index.is_some()
    }

    /// Vectors held (0 when uninitialized).
    pub fn count(&self) -> usize {
        self.index.as_ref().map_or(0, FlatIndex::count)
    }

    pub fn dim(&self) -> Option<usize> {
        self.index.as_ref().map(FlatIndex::dim)
    }

    /// Borrow the index for retrieval.
    pub fn index(&self) -> Result<&FlatIndex, StoreError> {
        self.index.as_ref().ok_or(StoreError::Rag(RagError::NotInitialized))
    }

    /// Load persisted artifacts if they match `dim`, else start empty.
    ///
    /// Safe to call repeatedly: a store already holding `dim` is untouched.
    pub fn load_or_init(&mut self, dim: usize) -> Result<LoadOutcome, StoreError> {
        if self.dim() == Some(dim) {
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        let index_path = self.dir.join(INDEX_FILE);
        let meta_path = self.dir.join(META_FILE);
        if !index_path.exists() || !meta_path.exists() {
            self.index = Some(FlatIndex::new(dim));
            return Ok(LoadOutcome::Fresh);
        }

        let bytes = std::fs::read(&index_path)?;
        let outcome = match FlatIndex::peek_dim(&bytes) {
            Ok(stored) if stored != dim => {
                tracing::warn!(
                    event = "store.reset_dimension_change",
                    stored_dim = stored,
                    new_dim = dim,
                    "embedding dimension changed; discarding persisted index"
                );
                None
            }
            Ok(_) => match read_pair(&bytes, &meta_path) {
                Ok(index) => Some(index),
                Err(e) => {
                    tracing::warn!(event = "store.discard_corrupt", error = %e, "discarding unreadable store artifacts");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(event = "store.discard_corrupt", error = %e, "discarding unreadable store artifacts");
                None
            }
        };

        Ok(match outcome {
            Some(index) => {
                let count = index.count();
                self.index = Some(index);
                LoadOutcome::Loaded { count }
            }
            None => {
                self.index = Some(FlatIndex::new(dim));
                LoadOutcome::Discarded
            }
        })
    }

    /// Drop all vectors and metadata, keeping (or setting) `dim`.
    pub fn reset(&mut self, dim: usize) {
        self.index = Some(FlatIndex::new(dim));
    }

    /// Append vectors and their metadata in order.
    pub fn add(&mut self, vectors: &EmbeddingMatrix, metadatas: Vec<Chunk>) -> Result<(), StoreError> {
        let index = self
            .index
            .as_mut()
            .ok_or(StoreError::Rag(RagError::NotInitialized))?;
        index.add(vectors, metadatas)?;
        Ok(())
    }

    pub fn search(&self, query: &[f32], pool_size: usize) -> Result<Vec<Neighbor>, StoreError> {
        Ok(self.index()?.search(query, pool_size)?)
    }

    /// Persist both artifacts via write-to-temp then rename.
    pub fn save(&self) -> Result<(), StoreError> {
        let index = self.index()?;
        std::fs::create_dir_all(&self.dir)?;

        let index_path = self.dir.join(INDEX_FILE);
        let meta_path = self.dir.join(META_FILE);
        let index_tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        let meta_tmp = self.dir.join(format!("{}.tmp", META_FILE));

        std::fs::write(&index_tmp, index.encode_vectors())?;
        std::fs::write(&meta_tmp, serde_json::to_vec_pretty(index.metadata())?)?;

        std::fs::rename(&index_tmp, &index_path)?;
        std::fs::rename(&meta_tmp, &meta_path)?;
        Ok(())
    }
}

fn read_pair(index_bytes: &[u8], meta_path: &Path) -> Result<FlatIndex, StoreError> {
    let (dim, vectors) = FlatIndex::decode_vectors(index_bytes)?;
    let metadata: Vec<Chunk> = serde_json::from_slice(&std::fs::read(meta_path)?)?;
    Ok(FlatIndex::from_parts(dim, vectors, metadata)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(doc: &str, i: usize) -> Chunk {
        Chunk {
            doc_id: doc.to_string(),
            chunk_id: ragchat_core::chunk::chunk_id(doc, i),
            department: "HR".to_string(),
            text: format!("text {}", i),
        }
    }

    fn rows(dim: usize, n: usize) -> EmbeddingMatrix {
        EmbeddingMatrix::from_rows(
            (0..n)
                .map(|i| {
                    let mut v = vec![0.0; dim];
                    v[i % dim] = 1.0;
                    v
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_add_before_init_fails() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::new(tmp.path());
        let err = store.add(&rows(2, 1), vec![chunk("a", 0)]).unwrap_err();
        assert!(err.is_not_initialized());
        assert!(store.search(&[1.0, 0.0], 5).unwrap_err().is_not_initialized());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::new(tmp.path());
        assert_eq!(store.load_or_init(4).unwrap(), LoadOutcome::Fresh);
        store
            .add(&rows(4, 3), vec![chunk("a", 0), chunk("a", 1), chunk("b", 0)])
            .unwrap();
        store.save().unwrap();

        let mut fresh = VectorStore::new(tmp.path());
        assert_eq!(fresh.load_or_init(4).unwrap(), LoadOutcome::Loaded { count: 3 });
        assert_eq!(fresh.count(), 3);
        assert_eq!(fresh.index().unwrap().metadata(), store.index().unwrap().metadata());
        assert!(!tmp.path().join("rag_index.bin.tmp").exists());
    }

    #[test]
    fn test_dimension_switch_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::new(tmp.path());
        store.load_or_init(4).unwrap();
        store.add(&rows(4, 2), vec![chunk("a", 0), chunk("a", 1)]).unwrap();
        store.save().unwrap();

        let mut other = VectorStore::new(tmp.path());
        assert_eq!(other.load_or_init(8).unwrap(), LoadOutcome::Discarded);
        assert_eq!(other.count(), 0);
        assert_eq!(other.dim(), Some(8));
    }

    #[test]
    fn test_load_or_init_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::new(tmp.path());
        store.load_or_init(2).unwrap();
        store.add(&rows(2, 1), vec![chunk("a", 0)]).unwrap();
        assert_eq!(store.load_or_init(2).unwrap(), LoadOutcome::AlreadyLoaded);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_wrong_dim_add_leaves_metadata() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::new(tmp.path());
        store.load_or_init(3).unwrap();
        store.add(&rows(3, 1), vec![chunk("a", 0)]).unwrap();

        let err = store.add(&rows(2, 1), vec![chunk("b", 0)]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rag(RagError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert_eq!(store.index().unwrap().metadata().len(), 1);
    }

    #[test]
    fn test_mismatched_pair_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::new(tmp.path());
        store.load_or_init(2).unwrap();
        store.add(&rows(2, 2), vec![chunk("a", 0), chunk("a", 1)]).unwrap();
        store.save().unwrap();

        // Simulate a crash between the two renames: metadata from an older save.
        std::fs::write(
            tmp.path().join(META_FILE),
            serde_json::to_vec(&vec![chunk("a", 0)]).unwrap(),
        )
        .unwrap();

        let mut reloaded = VectorStore::new(tmp.path());
        assert_eq!(reloaded.load_or_init(2).unwrap(), LoadOutcome::Discarded);
        assert_eq!(reloaded.count(), 0);
    }

    #[test]
    fn test_reset_clears() {
        let tmp = TempDir::new().unwrap();
        let mut store = VectorStore::new(tmp.path());
        store.load_or_init(2).unwrap();
        store.add(&rows(2, 1), vec![chunk("a", 0)]).unwrap();
        store.reset(2);
        assert_eq!(store.count(), 0);
        assert!(store.is_initialized());
    }
}
