use thiserror::Error;

/// Result alias for core retrieval operations.
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors raised by the chunker, embedding layer, and vector index.
///
/// None of these are retried inside the core; they propagate to the caller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RagError {
    /// Bad parameters such as `overlap >= size` or `size == 0`.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A vector's width disagrees with the index dimension.
    #[error("embedding dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The index was used before `load_or_init`, or holds no vectors.
    #[error("index not initialized")]
    NotInitialized,

    /// The embedding backend failed. Transport failures land here and are
    /// retryable from the caller's point of view.
    #[error("embedding backend error: {0}")]
    Embedding(String),

    /// A persisted index artifact could not be decoded.
    #[error("corrupt index artifact: {0}")]
    CorruptIndex(String),
}

impl RagError {
    /// True for failures a caller may reasonably retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RagError::Embedding(_))
    }
}
